use crate::core::{Result, Value, VersionedValue};
use crate::storage::engine::{DataMapRef, OrderedMap};
use crate::transaction::state::LocalTransaction;

/// A named logical map with transactional mutation.
///
/// Every `put`/`remove` runs the write-ahead protocol: read the current
/// versioned value, log it as the old value under the transaction's next log
/// id, then apply the new value (a remove applies a tombstone). The caller
/// serializes operations within one transaction; different transactions may
/// use the same map concurrently.
pub struct TransactionMap {
    map: DataMapRef,
}

impl TransactionMap {
    pub(crate) fn new(map: DataMapRef) -> Self {
        Self { map }
    }

    pub fn name(&self) -> &str {
        self.map.name()
    }

    pub fn map_id(&self) -> u32 {
        self.map.map_id()
    }

    /// The latest payload for `key`; a tombstone reads as absent.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.map.get(key).and_then(VersionedValue::into_value)
    }

    /// The latest versioned value, tombstones included.
    pub fn get_versioned(&self, key: &Value) -> Option<VersionedValue> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Put a value; returns the previous payload.
    pub fn put(&self, t: &mut LocalTransaction, key: Value, value: Value) -> Result<Option<Value>> {
        self.set(t, key, VersionedValue::new(value))
    }

    /// Remove a key by writing a tombstone; returns the previous payload.
    pub fn remove(&self, t: &mut LocalTransaction, key: Value) -> Result<Option<Value>> {
        self.set(t, key, VersionedValue::tombstone())
    }

    fn set(
        &self,
        t: &mut LocalTransaction,
        key: Value,
        new_value: VersionedValue,
    ) -> Result<Option<Value>> {
        t.check_not_closed()?;
        let old_value = self.map.get(&key);
        // write-ahead: the undo entry lands before the value
        t.log(self.map.map_id(), key.clone(), old_value.clone())?;
        if let Err(err) = self.map.insert(key, new_value) {
            t.log_undo()?;
            return Err(err);
        }
        Ok(old_value.and_then(VersionedValue::into_value))
    }
}
