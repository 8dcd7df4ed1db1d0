// ============================================================================
// Transaction State Management
// ============================================================================
//
// Lifecycle of a transaction:
//
//   Open ──prepare──> Prepared ──commit──> Committing ──> Closed
//     │                   │
//     └──────rollback─────┴──────────────> Closed
//
// A transaction is owned by one session thread; its operations are not
// synchronized against concurrent use from multiple threads. The engine
// handles synchronization across transactions.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result, Value, VersionedValue};
use crate::connection::Session;
use crate::transaction::change::ChangeIterator;
use crate::transaction::engine::TransactionEngine;
use crate::transaction::map::TransactionMap;
use crate::transaction::undo_log::UndoEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Transaction is active and can log mutations
    Open,

    /// Transaction reached a durable pre-commit checkpoint (two-phase use)
    Prepared,

    /// Commit started; undo entries are being (or were partially) purged
    Committing,

    /// Transaction is finished and discarded
    Closed,
}

impl TransactionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionStatus::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransactionStatus::Closed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Open => write!(f, "OPEN"),
            TransactionStatus::Prepared => write!(f, "PREPARED"),
            TransactionStatus::Committing => write!(f, "COMMITTING"),
            TransactionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Persisted record for a transaction that was named or prepared.
/// Unnamed, un-prepared transactions exist only through their undo entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedRecord {
    pub status: TransactionStatus,
    pub name: Option<String>,
}

/// A transaction on the local node.
///
/// Even ids mark local/autocommit transactions, odd ids mark distributed
/// ones; the parity is fixed at begin time for the whole lifetime.
pub struct LocalTransaction {
    engine: Arc<TransactionEngine>,
    session: Arc<dyn Session>,
    id: u32,
    status: TransactionStatus,
    name: Option<String>,
    /// Next log id; also the count of undo entries this transaction wrote.
    log_id: u64,
    /// Logical commit clock, assigned on distributed commit.
    commit_timestamp: Option<u32>,
}

impl LocalTransaction {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        session: Arc<dyn Session>,
        id: u32,
        status: TransactionStatus,
        name: Option<String>,
        log_id: u64,
    ) -> Self {
        Self {
            engine,
            session,
            id,
            status,
            name,
            log_id,
            commit_timestamp: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_distributed(&self) -> bool {
        self.id % 2 == 1
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name the transaction; named transactions are persisted so they
    /// survive a crash and can be resolved by an operator.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.name = Some(name.into());
        let engine = Arc::clone(&self.engine);
        engine.store_transaction(self)
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn commit_timestamp(&self) -> Option<u32> {
        self.commit_timestamp
    }

    pub(crate) fn set_commit_timestamp(&mut self, timestamp: u32) {
        self.commit_timestamp = Some(timestamp);
    }

    /// Open a transactional map; mutations through it are undo-logged
    /// against this engine.
    pub fn open_map(&self, name: &str) -> Result<TransactionMap> {
        self.engine.open_map(name)
    }

    /// Record an undo entry for the next mutation. Returns the log id the
    /// entry was written under.
    pub(crate) fn log(
        &mut self,
        map_id: u32,
        key: Value,
        old_value: Option<VersionedValue>,
    ) -> Result<u64> {
        let log_id = self.log_id;
        let engine = Arc::clone(&self.engine);
        engine.log(
            self.id,
            log_id,
            UndoEntry {
                map_id,
                key,
                old_value,
            },
        )?;
        self.log_id += 1;
        Ok(log_id)
    }

    /// Remove the last undo entry again, after the mutation it covered
    /// failed to apply.
    pub(crate) fn log_undo(&mut self) -> Result<()> {
        debug_assert!(self.log_id > 0);
        self.log_id -= 1;
        let engine = Arc::clone(&self.engine);
        engine.log_undo(self.id, self.log_id)
    }

    /// Durably mark this transaction prepared (first phase of two-phase
    /// commit).
    pub fn prepare(&mut self) -> Result<()> {
        if self.status != TransactionStatus::Open {
            return Err(DbError::IllegalState(format!(
                "Cannot prepare: transaction {} is {}",
                self.id, self.status
            )));
        }
        self.status = TransactionStatus::Prepared;
        let engine = Arc::clone(&self.engine);
        engine.store_transaction(self)
    }

    /// Commit. Local transactions purge their undo entries now; distributed
    /// transactions leave them for the external validator.
    pub fn commit(&mut self) -> Result<()> {
        self.check_not_closed()?;
        let engine = Arc::clone(&self.engine);
        let max_log_id = self.log_id;
        engine.commit(self, max_log_id)
    }

    /// Distributed commit: record the decision in the transaction status
    /// table, hand the transaction to the validator queue, then commit
    /// locally without purging the undo entries.
    pub fn commit_distributed(&mut self, all_local_transaction_names: &str) -> Result<()> {
        self.check_not_closed()?;
        let engine = Arc::clone(&self.engine);
        engine.commit_transaction_status_table(self, all_local_transaction_names)?;
        let max_log_id = self.log_id;
        engine.commit(self, max_log_id)
    }

    /// Roll back everything this transaction wrote and close it.
    pub fn rollback(&mut self) -> Result<()> {
        self.check_not_closed()?;
        let engine = Arc::clone(&self.engine);
        engine.rollback_to(self, self.log_id, 0)?;
        self.log_id = 0;
        engine.end_transaction(self)
    }

    /// A savepoint is just the current log id.
    pub fn savepoint_id(&self) -> u64 {
        self.log_id
    }

    /// Roll back to a savepoint previously returned by `savepoint_id`.
    pub fn rollback_to_savepoint(&mut self, savepoint_id: u64) -> Result<()> {
        self.check_not_closed()?;
        let engine = Arc::clone(&self.engine);
        engine.rollback_to(self, self.log_id, savepoint_id)?;
        self.log_id = savepoint_id;
        Ok(())
    }

    /// Replay this transaction's undo entries backward as logical changes,
    /// newest first, without mutating anything.
    pub fn get_changes(&self, max_log_id: u64, to_log_id: u64) -> ChangeIterator {
        self.engine.get_changes(self, max_log_id, to_log_id)
    }

    pub(crate) fn check_not_closed(&self) -> Result<()> {
        if self.status == TransactionStatus::Closed {
            return Err(DbError::IllegalState(format!(
                "Transaction {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("name", &self.name)
            .field("log_id", &self.log_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(TransactionStatus::Open.to_string(), "OPEN");
        assert_eq!(TransactionStatus::Prepared.to_string(), "PREPARED");
        assert_eq!(TransactionStatus::Committing.to_string(), "COMMITTING");
        assert_eq!(TransactionStatus::Closed.to_string(), "CLOSED");
    }

    #[test]
    fn test_status_predicates() {
        assert!(TransactionStatus::Open.is_open());
        assert!(!TransactionStatus::Open.is_closed());
        assert!(TransactionStatus::Closed.is_closed());
    }
}
