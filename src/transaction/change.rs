use std::iter::FusedIterator;
use std::sync::Arc;

use crate::core::Value;
use crate::transaction::engine::TransactionEngine;

/// A logical change replayed from the undo log: the value `key` held in
/// `map_name` *before* the transaction touched it (`None` if the key did
/// not exist).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub map_name: String,
    pub key: Value,
    pub value: Option<Value>,
}

/// Lazy backward replay of one transaction's undo entries.
///
/// Yields changes with log ids strictly in `[to_log_id, max_log_id)`, newest
/// first. The cursor is single-owner and non-restartable: once exhausted it
/// stays exhausted. Entries whose map was removed later are skipped.
pub struct ChangeIterator {
    engine: Arc<TransactionEngine>,
    transaction_id: u32,
    next_log_id: i64,
    to_log_id: i64,
    current: Option<Change>,
}

impl ChangeIterator {
    pub(crate) fn new(
        engine: Arc<TransactionEngine>,
        transaction_id: u32,
        max_log_id: u64,
        to_log_id: u64,
    ) -> Self {
        let mut iter = Self {
            engine,
            transaction_id,
            next_log_id: max_log_id as i64 - 1,
            to_log_id: to_log_id as i64,
            current: None,
        };
        iter.fetch_next();
        iter
    }

    fn fetch_next(&mut self) {
        self.current =
            self.engine
                .next_change(self.transaction_id, &mut self.next_log_id, self.to_log_id);
    }
}

impl Iterator for ChangeIterator {
    type Item = Change;

    fn next(&mut self) -> Option<Change> {
        let result = self.current.take()?;
        self.fetch_next();
        Some(result)
    }
}

impl FusedIterator for ChangeIterator {}
