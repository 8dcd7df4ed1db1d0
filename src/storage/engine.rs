use std::sync::Arc;

use crate::core::{Result, Value, VersionedValue};
use crate::transaction::state::PreparedRecord;
use crate::transaction::undo_log::UndoEntry;

/// An ordered map inside the store.
///
/// Navigation queries (`first_key`, `ceiling_key`, `floor_key`, `lower_key`)
/// are mandatory: the undo log locates entries of a single transaction by
/// jumping between neighboring keys rather than assuming contiguous ids.
/// Mutations are fallible so a store degraded to read-only can reject them.
pub trait OrderedMap<K, V>: Send + Sync {
    fn map_id(&self) -> u32;

    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Option<V>;

    /// Insert or replace; returns the previous value.
    fn insert(&self, key: K, value: V) -> Result<Option<V>>;

    /// Remove; returns the previous value if the key was present.
    fn remove(&self, key: &K) -> Result<Option<V>>;

    fn contains_key(&self, key: &K) -> bool;

    /// Smallest key in the map.
    fn first_key(&self) -> Option<K>;

    /// Smallest key `>= bound`.
    fn ceiling_key(&self, bound: &K) -> Option<K>;

    /// Largest key `<= bound`.
    fn floor_key(&self, bound: &K) -> Option<K>;

    /// Largest key `< bound`.
    fn lower_key(&self, bound: &K) -> Option<K>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a data map: application key -> versioned value.
pub type DataMapRef = Arc<dyn OrderedMap<Value, VersionedValue>>;

/// Handle to the undo log's map: operation id -> undo entry.
pub type UndoMapRef = Arc<dyn OrderedMap<u64, UndoEntry>>;

/// Handle to the prepared-transaction map: transaction id -> record.
pub type MetaMapRef = Arc<dyn OrderedMap<u32, PreparedRecord>>;

/// Storage contract the transaction engine requires from the underlying
/// ordered persistent store. The store's own compaction and on-disk format
/// are not part of this contract.
///
/// A map keeps the value kind it was first opened with; reopening it with a
/// different kind is data corruption and must fail, leaving the store
/// readable but rejecting further mutation.
pub trait OrderedStore: Send + Sync {
    /// Open (or create) a data map by name.
    fn open_map(&self, name: &str) -> Result<DataMapRef>;

    /// Open (or create) an undo-log map by name.
    fn open_undo_map(&self, name: &str) -> Result<UndoMapRef>;

    /// Open (or create) a metadata map by name.
    fn open_meta_map(&self, name: &str) -> Result<MetaMapRef>;

    /// Remove a map and its contents.
    fn remove_map(&self, name: &str) -> Result<()>;

    /// Resolve a map id back to its name; `None` if the map was removed.
    fn map_name(&self, map_id: u32) -> Option<String>;

    /// Names of all maps currently in the store.
    fn map_names(&self) -> Vec<String>;

    fn is_closed(&self) -> bool;

    /// Persist everything buffered since the last commit.
    fn commit(&self) -> Result<()>;

    /// Approximate bytes changed since the last commit.
    fn unsaved_memory(&self) -> usize;

    /// Unsaved-memory budget that triggers an automatic commit.
    fn auto_commit_memory(&self) -> usize;

    /// Auto-commit delay in milliseconds; 0 means commit on every
    /// transaction end.
    fn auto_commit_delay(&self) -> u64;
}
