//! Damaged pages are reported with their page id.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{PageStoreError, RELATED_RESOURCE_INDEX_ROOT, StoreError};

#[test]
fn test_flipped_byte_reports_page() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(60, cfg);
    let rels: Vec<_> = (1..=12).map(|r| relationship(r, 3, 0, r + 100)).collect();
    commit_relationships(&store, &rels);
    drop(store);

    let store = reopen(&disk, cfg);
    let root = store.head().root(RELATED_RESOURCE_INDEX_ROOT);
    disk.flip_byte(root, 300);

    let read = store.read().expect("read");
    let err = read.enumerate_related(1, 3, None).expect_err("corrupt root");
    match err.page_store_error() {
        Some(PageStoreError::Corruption { page_id, .. }) => assert_eq!(*page_id, root),
        other => panic!("expected corruption, got {other:?}"),
    }
}

#[test]
fn test_corruption_aborts_write_transaction() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(61, cfg);
    commit_relationships(&store, &[relationship(1, 3, 0, 2), relationship(2, 3, 0, 3)]);
    let head = store.head();
    let root = head.root(RELATED_RESOURCE_INDEX_ROOT);
    store.flush_related_cache();
    disk.flip_byte(root, 300);

    let mut txn = store.begin_write().expect("begin");
    let err = txn
        .add_related_resource(&relationship(4, 3, 0, 5))
        .expect_err("corrupt root");
    assert!(matches!(
        err.page_store_error(),
        Some(PageStoreError::Corruption { .. })
    ));
    assert!(matches!(txn.commit(), Err(StoreError::TransactionClosed)));
    assert_eq!(store.head(), head);
}
