/// Distributed transaction tests
///
/// Tests for id parity under cluster mode, deferred undo purging,
/// status-table recording, and the background validation worker.
/// Run with: cargo test --test cluster_transaction_tests

use std::sync::Arc;

use rustmvdb::transaction::engine::UNDO_LOG_MAP_NAME;
use rustmvdb::{
    DatabaseSession, InMemoryStore, LocalTransactionStatusTable, OrderedMap, OrderedStore,
    TransactionEngine, TransactionStatusTable, Value, ValidationWorker, cluster,
};

fn distributed_session() -> Arc<DatabaseSession> {
    Arc::new(DatabaseSession::new("clusterdb").auto_commit(false))
}

#[test]
fn test_parity_under_cluster_mode() {
    cluster::set_cluster_mode(true);
    let store = Arc::new(InMemoryStore::new());
    let engine = TransactionEngine::new(store as Arc<dyn OrderedStore>).unwrap();
    engine.init().unwrap();

    let t = engine.begin_transaction(distributed_session()).unwrap();
    assert_eq!(t.id(), 1);
    assert!(t.is_distributed());

    // autocommit sessions stay local even under cluster mode
    let t = engine
        .begin_transaction(Arc::new(DatabaseSession::new("clusterdb")))
        .unwrap();
    assert_eq!(t.id() % 2, 0);
    assert!(!t.is_distributed());
}

#[test]
fn test_distributed_commit_defers_undo_purge() {
    cluster::set_cluster_mode(true);
    let store = Arc::new(InMemoryStore::new());
    let table = Arc::new(LocalTransactionStatusTable::new());
    // no validator wired up: requests are dropped, entries stay
    let engine = TransactionEngine::with_coordinators(
        store.clone() as Arc<dyn OrderedStore>,
        table.clone(),
        Arc::new(rustmvdb::NoopTransactionValidator),
    )
    .unwrap();
    engine.init().unwrap();

    let mut t = engine.begin_transaction(distributed_session()).unwrap();
    assert!(t.is_distributed());
    let tid = t.id();
    let map = t.open_map("m").unwrap();
    map.put(&mut t, Value::from("a"), Value::Integer(1)).unwrap();
    map.put(&mut t, Value::from("b"), Value::Integer(2)).unwrap();

    t.commit_distributed("node1:t1").unwrap();
    assert!(t.commit_timestamp().is_some());
    assert!(table.is_committed(tid));

    // entries survive the commit until validation confirms
    let undo = store.open_undo_map(UNDO_LOG_MAP_NAME).unwrap();
    assert_eq!(undo.len(), 2);
    assert_eq!(map.get(&Value::from("a")), Some(Value::Integer(1)));

    engine.commit_after_validate(tid).unwrap();
    assert!(undo.is_empty());
}

#[test]
fn test_plain_commit_also_defers_for_odd_ids() {
    cluster::set_cluster_mode(true);
    let store = Arc::new(InMemoryStore::new());
    let engine = TransactionEngine::new(store.clone() as Arc<dyn OrderedStore>).unwrap();
    engine.init().unwrap();

    let mut t = engine.begin_transaction(distributed_session()).unwrap();
    let map = t.open_map("m").unwrap();
    map.put(&mut t, Value::from("a"), Value::Integer(1)).unwrap();
    t.commit().unwrap();

    let undo = store.open_undo_map(UNDO_LOG_MAP_NAME).unwrap();
    assert_eq!(undo.len(), 1);
}

#[test]
fn test_validation_worker_resolves_committed_transaction() {
    cluster::set_cluster_mode(true);
    let store = Arc::new(InMemoryStore::new());
    let table = Arc::new(LocalTransactionStatusTable::new());
    let worker = Arc::new(ValidationWorker::start(table.clone()).unwrap());
    let engine = TransactionEngine::with_coordinators(
        store.clone() as Arc<dyn OrderedStore>,
        table,
        worker.clone(),
    )
    .unwrap();
    engine.init().unwrap();

    let mut t = engine.begin_transaction(distributed_session()).unwrap();
    let map = t.open_map("m").unwrap();
    map.put(&mut t, Value::from("a"), Value::Integer(1)).unwrap();
    t.commit_distributed("node1:t1").unwrap();

    // stop drains the queue, so the purge has happened once it returns
    worker.stop().unwrap();

    let undo = store.open_undo_map(UNDO_LOG_MAP_NAME).unwrap();
    assert!(undo.is_empty());
    assert_eq!(map.get(&Value::from("a")), Some(Value::Integer(1)));
}

#[test]
fn test_validate_transaction_visibility() {
    cluster::set_cluster_mode(true);
    let store = Arc::new(InMemoryStore::new());
    let table = Arc::new(LocalTransactionStatusTable::new());
    let engine = TransactionEngine::with_coordinators(
        store as Arc<dyn OrderedStore>,
        table.clone(),
        Arc::new(rustmvdb::NoopTransactionValidator),
    )
    .unwrap();
    engine.init().unwrap();

    let session = distributed_session();
    let mut committed = engine.begin_transaction(session.clone()).unwrap();
    let committed_id = committed.id();
    let map = committed.open_map("m").unwrap();
    map.put(&mut committed, Value::from("a"), Value::Integer(1)).unwrap();
    committed.commit_distributed("node1:t1").unwrap();

    let current = engine.begin_transaction(session.clone()).unwrap();
    assert!(engine.validate_transaction(session.as_ref(), committed_id, &current));
    // a transaction always sees itself
    assert!(engine.validate_transaction(session.as_ref(), current.id(), &current));
    // an id with no commit decision is not visible
    assert!(!engine.validate_transaction(session.as_ref(), 999, &current));

    let record = table.record(committed_id).unwrap();
    assert_eq!(record.all_local_transaction_names, "node1:t1");
    assert!(record.commit_timestamp % 2 == 1);
}
