//! Graph ids are dense, stable and survive a reopen.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{GraphIndexError, StoreError};

#[test]
fn test_assert_graph_id_is_idempotent() {
    let (store, _disk) = memory_store(10, config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");

    assert_eq!(txn.assert_graph_id("urn:g1").expect("g1"), 0);
    assert_eq!(txn.assert_graph_id("urn:g1").expect("g1 again"), 0);
    assert_eq!(txn.assert_graph_id("urn:g2").expect("g2"), 1);
    assert_eq!(txn.try_find_graph_id("urn:g3"), None);
    assert_eq!(txn.get_graph_uri(1), Some("urn:g2"));
    txn.commit().expect("commit");
}

#[test]
fn test_graphs_survive_reopen() {
    let cfg = config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(11, cfg);
    let mut txn = store.begin_write().expect("begin");
    for i in 0..50 {
        txn.assert_graph_id(&format!("urn:graph:{i}")).expect("assert");
    }
    txn.delete_graph(7).expect("delete");
    txn.commit().expect("commit");
    drop(store);

    let store = reopen(&disk, cfg);
    let read = store.read().expect("read");
    assert_eq!(read.graphs().len(), 50);
    assert_eq!(read.try_find_graph_id("urn:graph:42"), Some(42));
    assert_eq!(read.get_graph_uri(0), Some("urn:graph:0"));

    let deleted: Vec<_> = read
        .enumerate_graphs()
        .filter(|entry| entry.is_deleted)
        .map(|entry| entry.id)
        .collect();
    assert_eq!(deleted, vec![7]);

    // Ids keep growing after a reopen and are never reused.
    drop(read);
    let mut txn = store.begin_write().expect("begin");
    assert_eq!(txn.assert_graph_id("urn:graph:new").expect("assert"), 50);
}

#[test]
fn test_delete_unknown_graph() {
    let (store, _disk) = memory_store(12, config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");
    let err = txn.delete_graph(3).expect_err("unknown graph");
    assert!(matches!(
        err,
        StoreError::Graph(GraphIndexError::NotFound { id: 3 })
    ));
}

#[test]
fn test_uncommitted_graphs_are_invisible() {
    let (store, _disk) = memory_store(13, config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");
    txn.assert_graph_id("urn:pending").expect("assert");

    let read = store.read().expect("read");
    assert_eq!(read.try_find_graph_id("urn:pending"), None);
    drop(read);

    txn.commit().expect("commit");
    let read = store.read().expect("read");
    assert_eq!(read.try_find_graph_id("urn:pending"), Some(0));
}
