// ============================================================================
// In-Memory Ordered Store
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::core::{DbError, Result, Value, VersionedValue};
use crate::storage::engine::{DataMapRef, MetaMapRef, OrderedMap, OrderedStore, UndoMapRef};
use crate::storage::persistence::{self, MapEntries, MapSnapshot, StoreSnapshot};
use crate::transaction::state::PreparedRecord;
use crate::transaction::undo_log::UndoEntry;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub(crate) auto_commit_delay_ms: u64,
    pub(crate) auto_commit_memory: usize,
    pub(crate) path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self {
            auto_commit_delay_ms: 1000,
            auto_commit_memory: 4 * 1024 * 1024,
            path: None,
        }
    }

    /// Delay before buffered changes are committed; 0 commits on every
    /// transaction end.
    pub fn auto_commit_delay_ms(mut self, millis: u64) -> Self {
        self.auto_commit_delay_ms = millis;
        self
    }

    /// Unsaved-memory budget that triggers an automatic commit.
    pub fn auto_commit_memory(mut self, bytes: usize) -> Self {
        self.auto_commit_memory = bytes;
        self
    }

    /// Snapshot file; commits persist the whole store there atomically.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Rough per-entry size used for unsaved-memory accounting.
const ENTRY_OVERHEAD: usize = 48;

/// Approximate in-memory footprint, for the unsaved-memory counter.
pub trait EstimateSize {
    fn estimated_size(&self) -> usize;
}

impl EstimateSize for u32 {
    fn estimated_size(&self) -> usize {
        8
    }
}

impl EstimateSize for u64 {
    fn estimated_size(&self) -> usize {
        8
    }
}

impl EstimateSize for Value {
    fn estimated_size(&self) -> usize {
        match self {
            Value::Text(s) => 24 + s.len(),
            _ => 16,
        }
    }
}

impl EstimateSize for VersionedValue {
    fn estimated_size(&self) -> usize {
        8 + self.value.as_ref().map_or(0, EstimateSize::estimated_size)
    }
}

impl EstimateSize for UndoEntry {
    fn estimated_size(&self) -> usize {
        16 + self.key.estimated_size()
            + self
                .old_value
                .as_ref()
                .map_or(0, EstimateSize::estimated_size)
    }
}

impl EstimateSize for PreparedRecord {
    fn estimated_size(&self) -> usize {
        16 + self.name.as_ref().map_or(0, String::len)
    }
}

// State every map handle shares with its store.
struct StoreShared {
    closed: AtomicBool,
    read_only: AtomicBool,
    unsaved: AtomicUsize,
}

/// One named ordered map, `BTreeMap`-backed, with its own lock so maps can
/// be used concurrently.
pub struct MemoryMap<K, V> {
    map_id: u32,
    name: String,
    shared: Arc<StoreShared>,
    entries: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord + Clone, V: Clone> MemoryMap<K, V> {
    fn new(map_id: u32, name: String, shared: Arc<StoreShared>) -> Self {
        Self {
            map_id,
            name,
            shared,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn from_entries(
        map_id: u32,
        name: String,
        shared: Arc<StoreShared>,
        entries: Vec<(K, V)>,
    ) -> Self {
        Self {
            map_id,
            name,
            shared,
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    // Lock poisoning is recovered rather than propagated: the tree holds
    // plain data and stays structurally valid even if a writer panicked.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<K, V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<K, V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn guard_writable(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DbError::IllegalState("store is closed".to_string()));
        }
        if self.shared.read_only.load(Ordering::SeqCst) {
            return Err(DbError::UnsupportedOperation(
                "store is read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn entries_vec(&self) -> Vec<(K, V)> {
        self.read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl<K, V> OrderedMap<K, V> for MemoryMap<K, V>
where
    K: Ord + Clone + EstimateSize + Send + Sync,
    V: Clone + EstimateSize + Send + Sync,
{
    fn map_id(&self) -> u32 {
        self.map_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.guard_writable()?;
        let added = ENTRY_OVERHEAD + key.estimated_size() + value.estimated_size();
        let previous = self.write().insert(key, value);
        self.shared.unsaved.fetch_add(added, Ordering::SeqCst);
        Ok(previous)
    }

    fn remove(&self, key: &K) -> Result<Option<V>> {
        self.guard_writable()?;
        let previous = self.write().remove(key);
        if previous.is_some() {
            self.shared.unsaved.fetch_add(ENTRY_OVERHEAD, Ordering::SeqCst);
        }
        Ok(previous)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    fn first_key(&self) -> Option<K> {
        self.read().keys().next().cloned()
    }

    fn ceiling_key(&self, bound: &K) -> Option<K> {
        self.read()
            .range((Bound::Included(bound), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
    }

    fn floor_key(&self, bound: &K) -> Option<K> {
        self.read()
            .range((Bound::Unbounded, Bound::Included(bound)))
            .next_back()
            .map(|(key, _)| key.clone())
    }

    fn lower_key(&self, bound: &K) -> Option<K> {
        self.read()
            .range((Bound::Unbounded, Bound::Excluded(bound)))
            .next_back()
            .map(|(key, _)| key.clone())
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}

enum MapSlot {
    Data(Arc<MemoryMap<Value, VersionedValue>>),
    Undo(Arc<MemoryMap<u64, UndoEntry>>),
    Meta(Arc<MemoryMap<u32, PreparedRecord>>),
}

impl MapSlot {
    fn map_id(&self) -> u32 {
        match self {
            MapSlot::Data(map) => map.map_id,
            MapSlot::Undo(map) => map.map_id,
            MapSlot::Meta(map) => map.map_id,
        }
    }
}

struct StoreInner {
    maps: HashMap<String, MapSlot>,
    ids: HashMap<u32, String>,
    next_map_id: u32,
}

/// `BTreeMap`-backed ordered store with optional snapshot persistence.
///
/// Each map carries the value kind it was first opened with; reopening a map
/// under a different kind is treated as corruption: the store degrades to
/// read-only and the open fails.
pub struct InMemoryStore {
    config: StoreConfig,
    shared: Arc<StoreShared>,
    inner: RwLock<StoreInner>,
    commit_count: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::empty(StoreConfig::new())
    }

    /// Open a store with the given configuration, loading the snapshot file
    /// if one exists at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if let Some(path) = config.path.clone() {
            if path.exists() {
                let snapshot = persistence::read_snapshot(&path)?;
                return Ok(Self::from_snapshot(config, snapshot));
            }
        }
        Ok(Self::empty(config))
    }

    fn empty(config: StoreConfig) -> Self {
        Self {
            config,
            shared: Arc::new(StoreShared {
                closed: AtomicBool::new(false),
                read_only: AtomicBool::new(false),
                unsaved: AtomicUsize::new(0),
            }),
            inner: RwLock::new(StoreInner {
                maps: HashMap::new(),
                ids: HashMap::new(),
                next_map_id: 1,
            }),
            commit_count: AtomicU64::new(0),
        }
    }

    fn from_snapshot(config: StoreConfig, snapshot: StoreSnapshot) -> Self {
        let store = Self::empty(config);
        {
            let mut inner = store
                .inner
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            inner.next_map_id = snapshot.next_map_id;
            for map in snapshot.maps {
                let shared = Arc::clone(&store.shared);
                let slot = match map.entries {
                    MapEntries::Data(entries) => MapSlot::Data(Arc::new(
                        MemoryMap::from_entries(map.map_id, map.name.clone(), shared, entries),
                    )),
                    MapEntries::Undo(entries) => MapSlot::Undo(Arc::new(
                        MemoryMap::from_entries(map.map_id, map.name.clone(), shared, entries),
                    )),
                    MapEntries::Meta(entries) => MapSlot::Meta(Arc::new(
                        MemoryMap::from_entries(map.map_id, map.name.clone(), shared, entries),
                    )),
                };
                inner.ids.insert(map.map_id, map.name.clone());
                inner.maps.insert(map.name, slot);
            }
        }
        store
    }

    /// Commit and refuse further access.
    pub fn close(&self) -> Result<()> {
        self.commit()?;
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// How many commits the store has performed.
    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only.load(Ordering::SeqCst)
    }

    fn corrupt_map_kind(&self, name: &str) -> DbError {
        self.shared.read_only.store(true, Ordering::SeqCst);
        DbError::TransactionCorrupt(format!(
            "Map '{}' open with a different value type",
            name
        ))
    }

    fn snapshot(&self) -> Result<StoreSnapshot> {
        let inner = self.inner.read()?;
        let mut maps = Vec::with_capacity(inner.maps.len());
        for (name, slot) in &inner.maps {
            let entries = match slot {
                MapSlot::Data(map) => MapEntries::Data(map.entries_vec()),
                MapSlot::Undo(map) => MapEntries::Undo(map.entries_vec()),
                MapSlot::Meta(map) => MapEntries::Meta(map.entries_vec()),
            };
            maps.push(MapSnapshot {
                name: name.clone(),
                map_id: slot.map_id(),
                entries,
            });
        }
        Ok(StoreSnapshot {
            version: persistence::SNAPSHOT_VERSION,
            next_map_id: inner.next_map_id,
            maps,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::IllegalState("store is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedStore for InMemoryStore {
    fn open_map(&self, name: &str) -> Result<DataMapRef> {
        self.check_open()?;
        let mut inner = self.inner.write()?;
        if let Some(slot) = inner.maps.get(name) {
            return match slot {
                MapSlot::Data(map) => Ok(Arc::clone(map) as DataMapRef),
                _ => Err(self.corrupt_map_kind(name)),
            };
        }
        let map_id = inner.next_map_id;
        inner.next_map_id += 1;
        let map = Arc::new(MemoryMap::new(
            map_id,
            name.to_string(),
            Arc::clone(&self.shared),
        ));
        inner.maps.insert(name.to_string(), MapSlot::Data(Arc::clone(&map)));
        inner.ids.insert(map_id, name.to_string());
        Ok(map)
    }

    fn open_undo_map(&self, name: &str) -> Result<UndoMapRef> {
        self.check_open()?;
        let mut inner = self.inner.write()?;
        if let Some(slot) = inner.maps.get(name) {
            return match slot {
                MapSlot::Undo(map) => Ok(Arc::clone(map) as UndoMapRef),
                _ => Err(self.corrupt_map_kind(name)),
            };
        }
        let map_id = inner.next_map_id;
        inner.next_map_id += 1;
        let map = Arc::new(MemoryMap::new(
            map_id,
            name.to_string(),
            Arc::clone(&self.shared),
        ));
        inner.maps.insert(name.to_string(), MapSlot::Undo(Arc::clone(&map)));
        inner.ids.insert(map_id, name.to_string());
        Ok(map)
    }

    fn open_meta_map(&self, name: &str) -> Result<MetaMapRef> {
        self.check_open()?;
        let mut inner = self.inner.write()?;
        if let Some(slot) = inner.maps.get(name) {
            return match slot {
                MapSlot::Meta(map) => Ok(Arc::clone(map) as MetaMapRef),
                _ => Err(self.corrupt_map_kind(name)),
            };
        }
        let map_id = inner.next_map_id;
        inner.next_map_id += 1;
        let map = Arc::new(MemoryMap::new(
            map_id,
            name.to_string(),
            Arc::clone(&self.shared),
        ));
        inner.maps.insert(name.to_string(), MapSlot::Meta(Arc::clone(&map)));
        inner.ids.insert(map_id, name.to_string());
        Ok(map)
    }

    fn remove_map(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.write()?;
        match inner.maps.remove(name) {
            Some(slot) => {
                inner.ids.remove(&slot.map_id());
                self.shared.unsaved.fetch_add(ENTRY_OVERHEAD, Ordering::SeqCst);
                Ok(())
            }
            None => Err(DbError::MapNotFound(name.to_string())),
        }
    }

    fn map_name(&self, map_id: u32) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .get(&map_id)
            .cloned()
    }

    fn map_names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .maps
            .keys()
            .cloned()
            .collect()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn commit(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if let Some(path) = &self.config.path {
            let snapshot = self.snapshot()?;
            persistence::write_snapshot(&snapshot, path)?;
        }
        self.shared.unsaved.store(0, Ordering::SeqCst);
        let count = self.commit_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("store commit #{}", count);
        Ok(())
    }

    fn unsaved_memory(&self) -> usize {
        self.shared.unsaved.load(Ordering::SeqCst)
    }

    fn auto_commit_memory(&self) -> usize {
        self.config.auto_commit_memory
    }

    fn auto_commit_delay(&self) -> u64 {
        self.config.auto_commit_delay_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_queries() {
        let store = InMemoryStore::new();
        let map = store.open_undo_map("undoLog").unwrap();
        for key in [10u64, 20, 30] {
            map.insert(
                key,
                UndoEntry {
                    map_id: 1,
                    key: Value::Integer(key as i64),
                    old_value: None,
                },
            )
            .unwrap();
        }

        assert_eq!(map.first_key(), Some(10));
        assert_eq!(map.ceiling_key(&15), Some(20));
        assert_eq!(map.ceiling_key(&20), Some(20));
        assert_eq!(map.floor_key(&25), Some(20));
        assert_eq!(map.floor_key(&20), Some(20));
        assert_eq!(map.lower_key(&20), Some(10));
        assert_eq!(map.lower_key(&10), None);
        assert_eq!(map.ceiling_key(&31), None);
    }

    #[test]
    fn test_map_kind_mismatch_degrades_to_read_only() {
        let store = InMemoryStore::new();
        let data = store.open_map("m").unwrap();
        data.insert(Value::from("k"), VersionedValue::new(Value::Integer(1)))
            .unwrap();

        let err = match store.open_undo_map("m") {
            Ok(_) => panic!("expected open_undo_map to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, DbError::TransactionCorrupt(_)));
        assert!(store.is_read_only());

        // reads still work, mutations are rejected
        assert!(data.get(&Value::from("k")).is_some());
        let err = data
            .insert(Value::from("k"), VersionedValue::new(Value::Integer(2)))
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_reopen_returns_same_map() {
        let store = InMemoryStore::new();
        let first = store.open_map("m").unwrap();
        first
            .insert(Value::from("k"), VersionedValue::new(Value::Integer(1)))
            .unwrap();
        let second = store.open_map("m").unwrap();
        assert_eq!(first.map_id(), second.map_id());
        assert!(second.get(&Value::from("k")).is_some());
    }

    #[test]
    fn test_map_name_resolution_and_removal() {
        let store = InMemoryStore::new();
        let map = store.open_map("m").unwrap();
        let map_id = map.map_id();
        assert_eq!(store.map_name(map_id), Some("m".to_string()));

        store.remove_map("m").unwrap();
        assert_eq!(store.map_name(map_id), None);
        assert!(matches!(
            store.remove_map("m").unwrap_err(),
            DbError::MapNotFound(_)
        ));
    }

    #[test]
    fn test_unsaved_memory_and_commit() {
        let store = InMemoryStore::new();
        let map = store.open_map("m").unwrap();
        assert_eq!(store.unsaved_memory(), 0);
        map.insert(Value::from("k"), VersionedValue::new(Value::from("v")))
            .unwrap();
        assert!(store.unsaved_memory() > 0);

        store.commit().unwrap();
        assert_eq!(store.unsaved_memory(), 0);
        assert_eq!(store.commit_count(), 1);
    }

    #[test]
    fn test_closed_store_rejects_access() {
        let store = InMemoryStore::new();
        let map = store.open_map("m").unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(store.open_map("other").is_err());
        assert!(map
            .insert(Value::from("k"), VersionedValue::new(Value::Integer(1)))
            .is_err());
    }
}
