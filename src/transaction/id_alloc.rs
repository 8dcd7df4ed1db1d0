use std::sync::atomic::{AtomicU32, Ordering};

use crate::cluster;
use crate::connection::Session;

/// Transaction ids wrap around once the counter reaches this bound.
pub const DEFAULT_MAX_TRANSACTION_ID: u32 = 0xffff;

/// Issues transaction ids with semantic parity: even ids for local/autocommit
/// transactions, odd ids for distributed (cluster-participating) ones.
///
/// Allocation is a lock-free compare-and-swap retry loop. When the counter
/// reaches the maximum it wraps to the smallest valid id of the requested
/// parity; uniqueness after a wrap relies on the previous holder having
/// closed, which the undo log enforces when the first entry collides.
pub struct TransactionIdAllocator {
    last: AtomicU32,
    max: AtomicU32,
}

impl TransactionIdAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
            max: AtomicU32::new(DEFAULT_MAX_TRANSACTION_ID),
        }
    }

    /// Set the bound after which ids are re-used.
    pub fn set_max(&self, max: u32) {
        self.max.store(max, Ordering::SeqCst);
    }

    /// Seed the last-seen id, used after recovery so new allocations start
    /// past unresolved transactions.
    pub(crate) fn seed(&self, last: u32) {
        self.last.store(last, Ordering::SeqCst);
    }

    /// Allocate an id for a transaction begun by `session`; distributed
    /// transactions (non-autocommit under cluster mode) get odd ids.
    pub fn next(&self, session: &dyn Session) -> u32 {
        if !session.is_auto_commit() && cluster::is_cluster_mode() {
            self.next_odd()
        } else {
            self.next_even()
        }
    }

    pub fn next_odd(&self) -> u32 {
        let max = self.max.load(Ordering::SeqCst);
        loop {
            let old = self.last.load(Ordering::SeqCst);
            let delta = if old % 2 == 0 { 1 } else { 2 };
            let mut next = old + delta;
            if next >= max {
                next = 1;
            }
            if self
                .last
                .compare_exchange(old, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn next_even(&self) -> u32 {
        let max = self.max.load(Ordering::SeqCst);
        loop {
            let old = self.last.load(Ordering::SeqCst);
            let delta = if old % 2 == 0 { 2 } else { 1 };
            let mut next = old + delta;
            if next >= max {
                next = 2;
            }
            if self
                .last
                .compare_exchange(old, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl Default for TransactionIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_even_sequence() {
        let alloc = TransactionIdAllocator::new();
        assert_eq!(alloc.next_even(), 2);
        assert_eq!(alloc.next_even(), 4);
        assert_eq!(alloc.next_even(), 6);
    }

    #[test]
    fn test_odd_sequence() {
        let alloc = TransactionIdAllocator::new();
        assert_eq!(alloc.next_odd(), 1);
        assert_eq!(alloc.next_odd(), 3);
    }

    #[test]
    fn test_parity_switch_always_lands_on_requested_parity() {
        let alloc = TransactionIdAllocator::new();
        assert_eq!(alloc.next_odd(), 1);
        assert_eq!(alloc.next_even(), 2);
        assert_eq!(alloc.next_odd(), 3);
        assert_eq!(alloc.next_even(), 4);
    }

    #[test]
    fn test_wraparound() {
        let alloc = TransactionIdAllocator::new();
        alloc.set_max(10);
        let evens: Vec<u32> = (0..6).map(|_| alloc.next_even()).collect();
        assert_eq!(evens, vec![2, 4, 6, 8, 2, 4]);

        let alloc = TransactionIdAllocator::new();
        alloc.set_max(10);
        let odds: Vec<u32> = (0..6).map(|_| alloc.next_odd()).collect();
        assert_eq!(odds, vec![1, 3, 5, 7, 9, 1]);
    }

    #[test]
    fn test_seed_continues_past_recovered_id() {
        let alloc = TransactionIdAllocator::new();
        alloc.seed(6);
        assert_eq!(alloc.next_even(), 8);
        alloc.seed(6);
        assert_eq!(alloc.next_odd(), 7);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let alloc = Arc::new(TransactionIdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..200).map(|_| alloc.next_even()).collect::<Vec<u32>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id % 2, 0);
                assert!(seen.insert(id), "id {} allocated twice", id);
            }
        }
    }
}
