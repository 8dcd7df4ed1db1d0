// ============================================================================
// RustMvDB Library
// ============================================================================

//! Embeddable MVCC transaction engine over an ordered persistent key-value
//! store: undo-log write-ahead rollback, savepoints, crash recovery, and
//! hooks for coordinating commit across cluster nodes.
//!
//! Concurrent sessions run one transaction each; local transactions purge
//! their undo entries at commit, distributed (odd-id) transactions leave
//! them for an external validator.
//!
//! # Examples
//!
//! ```
//! use rustmvdb::{DatabaseSession, InMemoryStore, TransactionEngine, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> rustmvdb::Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let engine = TransactionEngine::new(store)?;
//! engine.init()?;
//!
//! let session = Arc::new(DatabaseSession::new("demo"));
//! let mut t = engine.begin_transaction(session)?;
//! let accounts = t.open_map("accounts")?;
//! accounts.put(&mut t, Value::from("alice"), Value::Integer(100))?;
//!
//! let savepoint = t.savepoint_id();
//! accounts.put(&mut t, Value::from("alice"), Value::Integer(50))?;
//! t.rollback_to_savepoint(savepoint)?;
//! assert_eq!(accounts.get(&Value::from("alice")), Some(Value::Integer(100)));
//!
//! t.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod connection;
pub mod core;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use self::core::{DbError, Result, Value, VersionedValue};
pub use storage::{InMemoryStore, OrderedMap, OrderedStore, StoreConfig};
pub use transaction::{
    Change, ChangeIterator, LocalTransaction, TransactionEngine, TransactionMap,
    TransactionStatus,
};

// Re-export collaborator contracts
pub use cluster::{
    LocalTransactionStatusTable, NoopTransactionValidator, TransactionStatusTable,
    TransactionValidator, ValidationWorker,
};
pub use connection::{DatabaseSession, Session};
