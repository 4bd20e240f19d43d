//! The rewrite strategy recycles pages once no reader can reach them.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{PageStoreError, StoreError};

/// Commit the same churn workload and return how far the store grew.
fn growth_after_churn(strategy: PersistenceStrategy) -> u64 {
    let (store, _disk) = memory_store(70, small_config(strategy));
    let rels: Vec<_> = (1..=20).map(|r| relationship(r, 1, 0, r)).collect();
    commit_relationships(&store, &rels);
    let before = store.page_store().total_pages();

    for round in 0..10 {
        let mut txn = store.begin_write().expect("begin");
        for r in &rels {
            txn.delete_related_resource(r).expect("delete");
            let mut moved = *r;
            moved.related_resource += round + 1;
            txn.add_related_resource(&moved).expect("add");
        }
        txn.commit().expect("commit");
        let mut txn = store.begin_write().expect("begin");
        for r in &rels {
            let mut moved = *r;
            moved.related_resource += round + 1;
            txn.delete_related_resource(&moved).expect("delete");
            txn.add_related_resource(r).expect("add");
        }
        txn.commit().expect("commit");
    }

    let read = store.read().expect("read");
    assert_eq!(read.enumerate_predicate(1).count(), rels.len());
    store.page_store().total_pages() - before
}

#[test]
fn test_rewrite_reuses_pages() {
    let append_only = growth_after_churn(PersistenceStrategy::AppendOnly);
    let rewrite = growth_after_churn(PersistenceStrategy::Rewrite);
    assert!(
        rewrite * 4 < append_only,
        "rewrite grew by {rewrite} pages, append-only by {append_only}"
    );
}

#[test]
fn test_open_reader_blocks_reuse() {
    let (store, _disk) = memory_store(71, small_config(PersistenceStrategy::Rewrite));
    commit_relationships(&store, &[relationship(1, 1, 0, 1)]);

    let pinned = store.read().expect("read");
    let rels: Vec<_> = (2..=30).map(|r| relationship(r, 1, 0, r)).collect();
    commit_relationships(&store, &rels);

    // Every page the pinned reader can reach is still intact.
    assert_eq!(
        pinned.enumerate_related(1, 1, None).expect("enumerate"),
        vec![relationship(1, 1, 0, 1)]
    );
    assert_eq!(pinned.enumerate_predicate(1).count(), 1);
    assert_eq!(pinned.graphs().len(), 0);
}

#[test]
fn test_superseded_snapshot_expires() {
    let (store, _disk) = memory_store(72, small_config(PersistenceStrategy::Rewrite));
    commit_relationships(&store, &[relationship(1, 1, 0, 1)]);
    let first = store.head();
    commit_relationships(&store, &[relationship(1, 1, 0, 2), relationship(1, 1, 0, 3)]);

    let err = store.read_at(&first).expect_err("pages recycled");
    assert!(matches!(
        err,
        StoreError::Page(PageStoreError::SnapshotExpired { transaction_id: 1, .. })
    ));

    let head = store.head();
    let read = store.read_at(&head).expect("head is readable");
    assert_eq!(read.enumerate_related(1, 1, None).expect("enumerate").len(), 3);
}

#[test]
fn test_rewrite_has_single_commit_point() {
    let (store, _disk) = memory_store(73, config(PersistenceStrategy::Rewrite));
    commit_relationships(&store, &[relationship(1, 1, 0, 1), relationship(2, 1, 0, 1)]);

    let points = store.commit_points().expect("points");
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].transaction_id, 2);
    assert!(matches!(
        store.revert_to(&points[0]),
        Err(StoreError::Page(PageStoreError::HistoryUnavailable))
    ));
}
