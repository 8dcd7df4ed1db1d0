// ============================================================================
// Transaction Core
// ============================================================================

pub mod change;
pub mod engine;
pub mod id_alloc;
pub mod map;
pub mod state;
pub mod undo_log;

pub use change::{Change, ChangeIterator};
pub use engine::TransactionEngine;
pub use id_alloc::{DEFAULT_MAX_TRANSACTION_ID, TransactionIdAllocator};
pub use map::TransactionMap;
pub use state::{LocalTransaction, PreparedRecord, TransactionStatus};
pub use undo_log::UndoEntry;

/// Number of low bits of an operation id holding the per-transaction log id;
/// the transaction id occupies the 24 bits above them.
pub const LOG_ID_BITS: u32 = 40;

/// Combine a transaction id and a log id into an operation id.
///
/// Operation ids order first by transaction id, then by log id, so all
/// entries of one transaction form a contiguous key range in the undo log.
pub fn operation_id(transaction_id: u32, log_id: u64) -> u64 {
    debug_assert!(
        transaction_id < (1 << 24),
        "transaction id out of range: {}",
        transaction_id
    );
    debug_assert!(log_id < (1 << LOG_ID_BITS), "log id out of range: {}", log_id);
    ((transaction_id as u64) << LOG_ID_BITS) | log_id
}

/// The transaction id encoded in an operation id.
pub fn transaction_id_of(operation_id: u64) -> u32 {
    (operation_id >> LOG_ID_BITS) as u32
}

/// The log id encoded in an operation id.
pub fn log_id_of(operation_id: u64) -> u64 {
    operation_id & ((1 << LOG_ID_BITS) - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_round_trip() {
        let op = operation_id(7, 42);
        assert_eq!(transaction_id_of(op), 7);
        assert_eq!(log_id_of(op), 42);
    }

    #[test]
    fn test_operation_id_ordering() {
        // transaction id dominates, log id breaks ties
        assert!(operation_id(1, u32::MAX as u64) < operation_id(2, 0));
        assert!(operation_id(2, 0) < operation_id(2, 1));
    }
}
