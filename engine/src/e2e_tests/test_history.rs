//! Append-only stores keep every commit readable and can revert to one.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{
    GRAPH_INDEX_ROOT, PageStoreError, RELATED_RESOURCE_INDEX_ROOT, STATISTICS_ROOT, StoreError,
    TransactionHeader,
};

#[test]
fn test_commit_points_newest_first() {
    let (store, _disk) = memory_store(80, small_config(PersistenceStrategy::AppendOnly));
    let rels: Vec<_> = (1..=5).map(|r| relationship(r, 2, 0, r)).collect();
    commit_relationships(&store, &rels);

    let points = store.commit_points().expect("points");
    let ids: Vec<_> = points.iter().map(|p| p.transaction_id).collect();
    assert_eq!(ids, vec![5, 4, 3, 2, 1, 0]);

    // Every historical commit sees exactly the relationships committed so far.
    for point in &points {
        let read = store.read_at(point).expect("read historical");
        let count = read.enumerate_predicate(2).count();
        assert_eq!(count as u64, point.transaction_id);
    }
}

#[test]
fn test_revert_republishes_old_roots() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(81, cfg);

    let mut txn = store.begin_write().expect("begin");
    txn.assert_graph_id("urn:kept").expect("assert");
    txn.add_related_resource(&relationship(1, 2, 0, 3)).expect("add");
    txn.record_triples_added("p", 1).expect("record");
    let target = txn.commit().expect("commit");

    let mut txn = store.begin_write().expect("begin");
    txn.assert_graph_id("urn:dropped").expect("assert");
    txn.add_related_resource(&relationship(4, 2, 0, 5)).expect("add");
    txn.record_triples_added("p", 1).expect("record");
    txn.commit().expect("commit");

    let reverted = store.revert_to(&target).expect("revert");
    assert_eq!(reverted.transaction_id, 3);
    for name in [GRAPH_INDEX_ROOT, RELATED_RESOURCE_INDEX_ROOT] {
        assert_eq!(reverted.root(name), target.root(name));
    }
    assert_ne!(reverted.root(STATISTICS_ROOT), target.root(STATISTICS_ROOT));
    drop(store);

    let store = reopen(&disk, cfg);
    let read = store.read().expect("read");
    assert_eq!(read.transaction_id(), 3);
    assert_eq!(read.try_find_graph_id("urn:kept"), Some(0));
    assert_eq!(read.try_find_graph_id("urn:dropped"), None);
    assert_eq!(read.enumerate_predicate(2).count(), 1);
    let stats = read.statistics().expect("statistics").expect("record");
    assert_eq!(stats.total_triple_count, 1);
    assert_eq!(stats.commit_number, 3);

    // The revert record continues the statistics chain of the target.
    let history: Vec<_> = read
        .statistics_history()
        .into_iter()
        .map(|record| record.expect("record").commit_number)
        .collect();
    assert_eq!(history, vec![3, 1]);

    // The reverted-away commit is still in the history.
    let ids: Vec<_> = store
        .commit_points()
        .expect("points")
        .iter()
        .map(|p| p.transaction_id)
        .collect();
    assert_eq!(ids, vec![3, 2, 1, 0]);

    // The next write starts from the reverted state.
    drop(read);
    let mut txn = store.begin_write().expect("begin");
    assert_eq!(txn.assert_graph_id("urn:dropped").expect("assert"), 1);
}

#[test]
fn test_future_commit_is_unknown() {
    let (store, _disk) = memory_store(82, config(PersistenceStrategy::AppendOnly));
    commit_relationships(&store, &[relationship(1, 1, 0, 1)]);

    let mut future: TransactionHeader = store.head();
    future.transaction_id = 9;
    assert!(matches!(
        store.read_at(&future),
        Err(StoreError::Page(PageStoreError::UnknownCommit { transaction_id: 9 }))
    ));
    assert!(matches!(
        store.revert_to(&future),
        Err(StoreError::Page(PageStoreError::UnknownCommit { transaction_id: 9 }))
    ));
}
