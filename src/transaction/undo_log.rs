// ============================================================================
// Undo Log
// ============================================================================

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result, Value, VersionedValue};
use crate::storage::engine::{DataMapRef, OrderedMap, UndoMapRef};
use crate::transaction::{log_id_of, operation_id, transaction_id_of};

/// One write-ahead record: the value a key held before a transaction's
/// mutation. `old_value == None` means the key did not exist at all.
///
/// Entries are written before the data is changed. If the entry at log id 0
/// is missing while later entries survive, the transaction is partially
/// committed and rollback is no longer possible for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoEntry {
    pub map_id: u32,
    pub key: Value,
    pub old_value: Option<VersionedValue>,
}

/// The undo log shared by all transactions: a single ordered map keyed by
/// operation id. The engine wraps it in one mutex; every operation below
/// assumes that exclusion and holds it only for its own duration.
pub(crate) struct UndoLog {
    map: UndoMapRef,
}

impl UndoLog {
    pub(crate) fn new(map: UndoMapRef) -> Self {
        Self { map }
    }

    /// Write the undo entry for `(transaction_id, log_id)`. A collision at
    /// log id 0 means a stale transaction with the same id never closed.
    pub(crate) fn log(&self, transaction_id: u32, log_id: u64, entry: UndoEntry) -> Result<()> {
        let undo_key = operation_id(transaction_id, log_id);
        if log_id == 0 && self.map.contains_key(&undo_key) {
            return Err(DbError::TransactionStillOpen(transaction_id));
        }
        self.map.insert(undo_key, entry)?;
        Ok(())
    }

    /// Remove a single entry; it must still exist. A missing entry means a
    /// concurrent rollback already consumed it, which callers must treat as
    /// fatal to the operation.
    pub(crate) fn log_undo(&self, transaction_id: u32, log_id: u64) -> Result<()> {
        let undo_key = operation_id(transaction_id, log_id);
        if self.map.remove(&undo_key)?.is_none() {
            return Err(DbError::ConcurrentlyRolledBack(transaction_id));
        }
        Ok(())
    }

    /// Purge the entries of `transaction_id` in `[0, max_log_id)`. Runs at
    /// commit time, when the values are already in place: this only deletes
    /// bookkeeping. Gaps from an interrupted earlier purge are skipped by
    /// jumping to the next surviving entry.
    pub(crate) fn remove_range(&self, transaction_id: u32, max_log_id: u64) -> Result<()> {
        let mut log_id = 0u64;
        while log_id < max_log_id {
            let undo_key = operation_id(transaction_id, log_id);
            if self.map.contains_key(&undo_key) {
                self.map.remove(&undo_key)?;
                log_id += 1;
            } else {
                // partially committed: jump to the next surviving entry
                match self.map.ceiling_key(&undo_key) {
                    Some(next) if transaction_id_of(next) == transaction_id => {
                        log_id = log_id_of(next);
                    }
                    _ => break,
                }
            }
        }
        Ok(())
    }

    /// Walk the entries of `transaction_id` backward from `max_log_id - 1`
    /// down to `to_log_id`, restoring each old value into its map and
    /// deleting the entry. Gaps from an interrupted earlier rollback are
    /// skipped via the floor entry; entries of other transactions end the
    /// scan.
    pub(crate) fn rollback_to(
        &self,
        transaction_id: u32,
        max_log_id: u64,
        to_log_id: u64,
        resolve_map: &mut dyn FnMut(u32) -> Option<DataMapRef>,
    ) -> Result<()> {
        let mut log_id = max_log_id;
        while log_id > to_log_id {
            let current = log_id - 1;
            let undo_key = operation_id(transaction_id, current);
            match self.map.get(&undo_key) {
                None => {
                    // partially rolled back: jump to the previous entry
                    match self.map.floor_key(&undo_key) {
                        Some(prev) if transaction_id_of(prev) == transaction_id => {
                            log_id = log_id_of(prev) + 1;
                        }
                        _ => break,
                    }
                }
                Some(entry) => {
                    match resolve_map(entry.map_id) {
                        None => {
                            // map removed later on; nothing to restore
                            warn!(
                                "undo entry for removed map {} skipped during rollback of {}",
                                entry.map_id, transaction_id
                            );
                        }
                        Some(map) => match entry.old_value {
                            // this transaction added the key
                            None => {
                                map.remove(&entry.key)?;
                            }
                            // this transaction replaced the value
                            Some(old_value) => {
                                map.insert(entry.key, old_value)?;
                            }
                        },
                    }
                    self.map.remove(&undo_key)?;
                    log_id = current;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, undo_key: u64) -> Option<UndoEntry> {
        self.map.get(&undo_key)
    }

    pub(crate) fn contains(&self, undo_key: u64) -> bool {
        self.map.contains_key(&undo_key)
    }

    pub(crate) fn first_key(&self) -> Option<u64> {
        self.map.first_key()
    }

    pub(crate) fn ceiling_key(&self, bound: u64) -> Option<u64> {
        self.map.ceiling_key(&bound)
    }

    pub(crate) fn floor_key(&self, bound: u64) -> Option<u64> {
        self.map.floor_key(&bound)
    }

    pub(crate) fn lower_key(&self, bound: u64) -> Option<u64> {
        self.map.lower_key(&bound)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::OrderedStore;
    use crate::storage::memory::InMemoryStore;
    use std::sync::Arc;

    fn undo_log_fixture() -> (Arc<InMemoryStore>, UndoLog, DataMapRef) {
        let store = Arc::new(InMemoryStore::new());
        let undo = UndoLog::new(store.open_undo_map("undoLog").unwrap());
        let data = store.open_map("data").unwrap();
        (store, undo, data)
    }

    fn entry(map: &DataMapRef, key: &str, old_value: Option<VersionedValue>) -> UndoEntry {
        UndoEntry {
            map_id: map.map_id(),
            key: Value::from(key),
            old_value,
        }
    }

    #[test]
    fn test_log_collision_at_first_entry() {
        let (_store, undo, data) = undo_log_fixture();
        undo.log(2, 0, entry(&data, "a", None)).unwrap();
        let err = undo.log(2, 0, entry(&data, "a", None)).unwrap_err();
        assert!(matches!(err, DbError::TransactionStillOpen(2)));
        // later log ids do not collide
        undo.log(2, 1, entry(&data, "b", None)).unwrap();
    }

    #[test]
    fn test_log_undo_requires_entry() {
        let (_store, undo, data) = undo_log_fixture();
        undo.log(2, 0, entry(&data, "a", None)).unwrap();
        undo.log_undo(2, 0).unwrap();
        let err = undo.log_undo(2, 0).unwrap_err();
        assert!(matches!(err, DbError::ConcurrentlyRolledBack(2)));
    }

    #[test]
    fn test_rollback_restores_old_values() {
        let (_store, undo, data) = undo_log_fixture();
        // key "a" existed with value 1, key "b" was added
        data.insert(Value::from("a"), VersionedValue::new(Value::Integer(2)))
            .unwrap();
        data.insert(Value::from("b"), VersionedValue::new(Value::Integer(3)))
            .unwrap();
        undo.log(
            2,
            0,
            entry(&data, "a", Some(VersionedValue::new(Value::Integer(1)))),
        )
        .unwrap();
        undo.log(2, 1, entry(&data, "b", None)).unwrap();

        let resolved = data.clone();
        undo.rollback_to(2, 2, 0, &mut |_| Some(resolved.clone()))
            .unwrap();

        assert_eq!(
            data.get(&Value::from("a")),
            Some(VersionedValue::new(Value::Integer(1)))
        );
        assert_eq!(data.get(&Value::from("b")), None);
        assert!(undo.is_empty());
    }

    #[test]
    fn test_rollback_stops_at_other_transaction() {
        let (_store, undo, data) = undo_log_fixture();
        undo.log(1, 0, entry(&data, "x", None)).unwrap();
        undo.log(2, 0, entry(&data, "y", None)).unwrap();

        let resolved = data.clone();
        undo.rollback_to(2, 1, 0, &mut |_| Some(resolved.clone()))
            .unwrap();

        // transaction 1's entry is untouched
        assert!(undo.contains(operation_id(1, 0)));
        assert!(!undo.contains(operation_id(2, 0)));
    }

    #[test]
    fn test_remove_range_skips_purged_entries() {
        let (_store, undo, data) = undo_log_fixture();
        undo.log(2, 0, entry(&data, "a", None)).unwrap();
        undo.log(2, 1, entry(&data, "b", None)).unwrap();
        undo.log(2, 2, entry(&data, "c", None)).unwrap();
        // simulate a crash that already purged the middle entry
        undo.log_undo(2, 1).unwrap();

        undo.remove_range(2, u64::MAX).unwrap();
        assert!(undo.is_empty());
        // the purge never touches data maps
        assert_eq!(data.len(), 0);
    }

    #[test]
    fn test_remove_range_respects_bound() {
        let (_store, undo, data) = undo_log_fixture();
        for log_id in 0..4 {
            undo.log(2, log_id, entry(&data, "k", None)).unwrap();
        }
        undo.remove_range(2, 2).unwrap();
        assert!(!undo.contains(operation_id(2, 0)));
        assert!(!undo.contains(operation_id(2, 1)));
        assert!(undo.contains(operation_id(2, 2)));
        assert!(undo.contains(operation_id(2, 3)));
    }
}
