// ============================================================================
// Transaction Engine
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::cluster;
use crate::cluster::status_table::{LocalTransactionStatusTable, TransactionStatusTable};
use crate::cluster::validator::{NoopTransactionValidator, TransactionValidator, ValidationRequest};
use crate::connection::Session;
use crate::core::{DbError, Result};
use crate::storage::engine::{DataMapRef, MetaMapRef, OrderedMap, OrderedStore};
use crate::transaction::change::{Change, ChangeIterator};
use crate::transaction::id_alloc::TransactionIdAllocator;
use crate::transaction::map::TransactionMap;
use crate::transaction::state::{LocalTransaction, PreparedRecord, TransactionStatus};
use crate::transaction::undo_log::{UndoEntry, UndoLog};
use crate::transaction::{log_id_of, operation_id, transaction_id_of};

/// Name of the undo log's map inside the store.
pub const UNDO_LOG_MAP_NAME: &str = "undoLog";

/// Name of the persisted prepared-transaction map.
pub const PREPARED_TRANSACTIONS_MAP_NAME: &str = "openTransactions";

/// Temporary maps carry this prefix and are dropped on `init`.
pub const TEMP_MAP_PREFIX: &str = "temp.";

// Engine-level bookkeeping; its mutex is one of the two exclusion domains.
// Code needing both domains acquires this one first, the undo log second,
// never the reverse.
struct EngineInner {
    init: bool,
    /// Registry of data maps by id, for resolving undo entries.
    maps: HashMap<u32, DataMapRef>,
    prepared: MetaMapRef,
    next_temp_map_id: u32,
}

impl EngineInner {
    /// Resolve a map id, reopening from the store on a cache miss. `None`
    /// means the map was removed later on, which undo processing tolerates.
    fn open_map_by_id(&mut self, map_id: u32, store: &dyn OrderedStore) -> Option<DataMapRef> {
        if let Some(map) = self.maps.get(&map_id) {
            return Some(Arc::clone(map));
        }
        let name = store.map_name(map_id)?;
        match store.open_map(&name) {
            Ok(map) => {
                self.maps.insert(map_id, Arc::clone(&map));
                Some(map)
            }
            Err(err) => {
                warn!("failed to reopen map {} ('{}'): {}", map_id, name, err);
                None
            }
        }
    }
}

/// The transaction engine: owns the undo log, the prepared-transaction
/// table, the registry of open transaction maps, and the id allocator.
///
/// Safe for concurrent use by different transactions; a single transaction's
/// operations must be serialized by its owning session.
pub struct TransactionEngine {
    store: Arc<dyn OrderedStore>,
    inner: Mutex<EngineInner>,
    undo: Mutex<UndoLog>,
    ids: TransactionIdAllocator,
    status_table: Arc<dyn TransactionStatusTable>,
    validator: Arc<dyn TransactionValidator>,
}

impl TransactionEngine {
    /// Engine with local-only defaults: an in-memory status table and a
    /// validator that drops requests. Fails if the undo log's value type
    /// does not match, in which case the store stays usable for reads only.
    pub fn new(store: Arc<dyn OrderedStore>) -> Result<Arc<Self>> {
        Self::with_coordinators(
            store,
            Arc::new(LocalTransactionStatusTable::new()),
            Arc::new(NoopTransactionValidator),
        )
    }

    /// Engine wired to explicit distributed-commit collaborators.
    pub fn with_coordinators(
        store: Arc<dyn OrderedStore>,
        status_table: Arc<dyn TransactionStatusTable>,
        validator: Arc<dyn TransactionValidator>,
    ) -> Result<Arc<Self>> {
        let undo_map = store.open_undo_map(UNDO_LOG_MAP_NAME)?;
        let prepared = store.open_meta_map(PREPARED_TRANSACTIONS_MAP_NAME)?;
        Ok(Arc::new(Self {
            store,
            inner: Mutex::new(EngineInner {
                init: false,
                maps: HashMap::new(),
                prepared,
                next_temp_map_id: 0,
            }),
            undo: Mutex::new(UndoLog::new(undo_map)),
            ids: TransactionIdAllocator::new(),
            status_table,
            validator,
        }))
    }

    /// Set the maximum transaction id, after which ids are re-used. If an
    /// old transaction is still open when its id comes around again, the new
    /// transaction fails at its first logged mutation.
    pub fn set_max_transaction_id(&self, max: u32) {
        self.ids.set_max(max);
    }

    /// Initialize the engine; required before any transaction can begin.
    /// Drops leftover temporary maps and seeds the id allocator from the
    /// lowest surviving undo entry so post-recovery allocation starts past
    /// unresolved transactions.
    pub fn init(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.init = true;

        for map_name in self.store.map_names() {
            if map_name.starts_with(TEMP_MAP_PREFIX) {
                debug!("dropping leftover temporary map '{}'", map_name);
                self.store.remove_map(&map_name)?;
            }
        }

        let undo = self.undo.lock()?;
        if let Some(first) = undo.first_key() {
            let last_seen = transaction_id_of(first);
            info!("undo log has surviving entries, seeding allocator at {}", last_seen);
            self.ids.seed(last_seen);
        }
        Ok(())
    }

    /// Begin a new transaction for `session`. The id parity is fixed here:
    /// odd for non-autocommit sessions under cluster mode, even otherwise.
    pub fn begin_transaction(
        self: &Arc<Self>,
        session: Arc<dyn Session>,
    ) -> Result<LocalTransaction> {
        {
            let inner = self.inner.lock()?;
            if !inner.init {
                return Err(DbError::NotInitialized);
            }
        }
        let id = self.ids.next(session.as_ref());
        debug!("begin transaction {}", id);
        Ok(LocalTransaction::new(
            Arc::clone(self),
            session,
            id,
            TransactionStatus::Open,
            None,
            0,
        ))
    }

    /// Persist `(status, name)` for transactions that are named or prepared;
    /// everything else exists only through its undo entries.
    pub(crate) fn store_transaction(&self, t: &LocalTransaction) -> Result<()> {
        if t.status() == TransactionStatus::Prepared || t.name().is_some() {
            let inner = self.inner.lock()?;
            inner.prepared.insert(
                t.id(),
                PreparedRecord {
                    status: t.status(),
                    name: t.name().map(str::to_string),
                },
            )?;
        }
        Ok(())
    }

    /// Write one undo entry for `t`.
    pub(crate) fn log(&self, transaction_id: u32, log_id: u64, entry: UndoEntry) -> Result<()> {
        let undo = self.undo.lock()?;
        undo.log(transaction_id, log_id, entry)
    }

    /// Remove one undo entry again.
    pub(crate) fn log_undo(&self, transaction_id: u32, log_id: u64) -> Result<()> {
        let undo = self.undo.lock()?;
        undo.log_undo(transaction_id, log_id)
    }

    /// Commit `t`. Local (even-id) transactions purge their undo entries
    /// now; distributed (odd-id) transactions leave them in place until the
    /// external validator confirms via `commit_after_validate`.
    pub(crate) fn commit(&self, t: &mut LocalTransaction, max_log_id: u64) -> Result<()> {
        if self.store.is_closed() {
            return Ok(());
        }
        t.set_status(TransactionStatus::Committing);
        if t.id() % 2 == 0 {
            let undo = self.undo.lock()?;
            undo.remove_range(t.id(), max_log_id)?;
        }
        self.end_transaction(t)
    }

    /// Purge the full undo range of a distributed transaction once the
    /// external validator confirmed it.
    pub fn commit_after_validate(&self, transaction_id: u32) -> Result<()> {
        if self.store.is_closed() {
            return Ok(());
        }
        debug!("purging validated transaction {}", transaction_id);
        let undo = self.undo.lock()?;
        undo.remove_range(transaction_id, u64::MAX)
    }

    /// Close `t`: drop its prepared record, mark it closed, and fold
    /// buffered store changes into a commit when the configuration asks for
    /// it (no delay) or when nothing is open and the unsaved budget is 3/4
    /// full.
    pub(crate) fn end_transaction(&self, t: &mut LocalTransaction) -> Result<()> {
        let inner = self.inner.lock()?;
        inner.prepared.remove(&t.id())?;
        t.set_status(TransactionStatus::Closed);
        debug!("transaction {} closed", t.id());

        if self.store.auto_commit_delay() == 0 {
            return self.store.commit();
        }
        // the undo-log lock is released before any store commit
        let no_open_transactions = {
            let undo = self.undo.lock()?;
            undo.is_empty()
        };
        if no_open_transactions {
            let unsaved = self.store.unsaved_memory();
            let max = self.store.auto_commit_memory();
            // save at 3/4 capacity
            if unsaved * 4 > max * 3 {
                self.store.commit()?;
            }
        }
        Ok(())
    }

    /// Roll `t` back to `to_log_id`; 0 is a full rollback.
    pub(crate) fn rollback_to(
        &self,
        t: &LocalTransaction,
        max_log_id: u64,
        to_log_id: u64,
    ) -> Result<()> {
        debug!(
            "rollback transaction {} from {} to {}",
            t.id(),
            max_log_id,
            to_log_id
        );
        let mut inner = self.inner.lock()?;
        let undo = self.undo.lock()?;
        let store = Arc::clone(&self.store);
        undo.rollback_to(t.id(), max_log_id, to_log_id, &mut |map_id| {
            inner.open_map_by_id(map_id, store.as_ref())
        })
    }

    /// Replay `t`'s undo entries backward as logical changes.
    pub(crate) fn get_changes(
        self: &Arc<Self>,
        t: &LocalTransaction,
        max_log_id: u64,
        to_log_id: u64,
    ) -> ChangeIterator {
        ChangeIterator::new(Arc::clone(self), t.id(), max_log_id, to_log_id)
    }

    /// One step of the backward change walk; used by `ChangeIterator`.
    pub(crate) fn next_change(
        &self,
        transaction_id: u32,
        next_log_id: &mut i64,
        to_log_id: i64,
    ) -> Option<Change> {
        let mut inner = self.inner.lock().ok()?;
        let undo = self.undo.lock().ok()?;
        while *next_log_id >= to_log_id {
            let undo_key = operation_id(transaction_id, *next_log_id as u64);
            let entry = undo.get(undo_key);
            *next_log_id -= 1;
            let Some(entry) = entry else {
                // partially rolled back: jump to the previous entry
                let prev = undo
                    .floor_key(undo_key)
                    .filter(|key| transaction_id_of(*key) == transaction_id)?;
                *next_log_id = log_id_of(prev) as i64;
                continue;
            };
            let Some(map) = inner.open_map_by_id(entry.map_id, self.store.as_ref()) else {
                // map removed later on
                continue;
            };
            return Some(Change {
                map_name: map.name().to_string(),
                key: entry.key,
                value: entry.old_value.and_then(|old| old.value),
            });
        }
        None
    }

    /// Reconstruct the unclosed transactions that still have undo entries,
    /// sorted by id. Status comes from the prepared-transaction table when a
    /// record exists; otherwise a surviving first entry means `Open` and a
    /// missing one means a commit was interrupted mid-purge (`Committing`).
    pub fn get_open_transactions(
        self: &Arc<Self>,
        session: &Arc<dyn Session>,
    ) -> Result<Vec<LocalTransaction>> {
        let inner = self.inner.lock()?;
        let undo = self.undo.lock()?;
        let mut list = Vec::new();
        let mut key = undo.first_key();
        while let Some(first_of_transaction) = key {
            let transaction_id = transaction_id_of(first_of_transaction);
            let next_transaction = operation_id(transaction_id + 1, 0);
            let last = undo
                .lower_key(next_transaction)
                .unwrap_or(first_of_transaction);
            let log_id = log_id_of(last) + 1;
            let (status, name) = match inner.prepared.get(&transaction_id) {
                Some(record) => (record.status, record.name),
                None => {
                    if undo.contains(operation_id(transaction_id, 0)) {
                        (TransactionStatus::Open, None)
                    } else {
                        (TransactionStatus::Committing, None)
                    }
                }
            };
            list.push(LocalTransaction::new(
                Arc::clone(self),
                Arc::clone(session),
                transaction_id,
                status,
                name,
                log_id,
            ));
            key = undo.ceiling_key(next_transaction);
        }
        Ok(list)
    }

    /// Open a transactional map by name and register it for undo
    /// resolution.
    pub fn open_map(self: &Arc<Self>, name: &str) -> Result<TransactionMap> {
        let mut inner = self.inner.lock()?;
        let map = self.store.open_map(name)?;
        inner.maps.insert(map.map_id(), Arc::clone(&map));
        Ok(TransactionMap::new(map))
    }

    /// Remove a map and drop it from the registry.
    pub fn remove_map(&self, map: &TransactionMap) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.maps.remove(&map.map_id());
        self.store.remove_map(map.name())
    }

    /// Create a temporary map; such maps are dropped when the engine is
    /// initialized after a restart.
    pub fn create_temp_map(&self) -> Result<DataMapRef> {
        let mut inner = self.inner.lock()?;
        let name = format!("{}{}", TEMP_MAP_PREFIX, inner.next_temp_map_id);
        inner.next_temp_map_id += 1;
        self.store.open_map(&name)
    }

    /// Record the distributed commit decision and hand the transaction to
    /// the validator queue. The enqueue is fire-and-forget: the commit path
    /// never waits for validation.
    pub(crate) fn commit_transaction_status_table(
        self: &Arc<Self>,
        t: &mut LocalTransaction,
        all_local_transaction_names: &str,
    ) -> Result<()> {
        // the odd allocator doubles as a logical commit clock
        t.set_commit_timestamp(self.ids.next_odd());
        self.status_table.commit(t, all_local_transaction_names)?;
        let session = t.session();
        self.validator.enqueue(ValidationRequest {
            database: session.database_short_name().to_string(),
            engine: Arc::clone(self),
            transaction_id: t.id(),
            properties: session.original_properties(),
            all_local_transaction_names: all_local_transaction_names.to_string(),
        });
        Ok(())
    }

    /// Whether `transaction_id`'s writes should be visible to `current`.
    pub fn validate_transaction(
        &self,
        session: &dyn Session,
        transaction_id: u32,
        current: &LocalTransaction,
    ) -> bool {
        self.status_table
            .is_valid(session, &cluster::host_and_port(), transaction_id, current)
    }

    /// Force a final store commit.
    pub fn close(&self) -> Result<()> {
        self.store.commit()
    }
}
