//! Reopening after a crash or a damaged header finds the last durable commit.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::{FaultConfig, Page, PageType, StoreError};

#[test]
fn test_crash_drops_unsynced_writes() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(50, cfg);
    commit_relationships(&store, &[relationship(1, 1, 0, 10)]);

    let mut txn = store.begin_write().expect("begin");
    for resource in 2..20 {
        txn.add_related_resource(&relationship(resource, 1, 0, 10))
            .expect("add");
    }
    // The process dies before the commit.
    disk.crash();
    drop(txn);
    drop(store);

    let store = reopen(&disk, cfg);
    assert_eq!(store.head().transaction_id, 1);
    let read = store.read().expect("read");
    assert_eq!(read.enumerate_predicate(1).count(), 1);
}

#[test]
fn test_failed_sync_keeps_previous_head() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(51, cfg);
    commit_relationships(&store, &[relationship(1, 1, 0, 10)]);

    let mut txn = store.begin_write().expect("begin");
    txn.add_related_resource(&relationship(2, 1, 0, 10)).expect("add");
    disk.set_fault_config(FaultConfig::failing_sync());
    let err = txn.commit().expect_err("sync fails");
    assert!(matches!(err, StoreError::Page(_)));
    assert_eq!(store.head().transaction_id, 1);

    disk.set_fault_config(FaultConfig::no_faults());
    disk.crash();
    drop(store);

    let store = reopen(&disk, cfg);
    assert_eq!(store.head().transaction_id, 1);
    let read = store.read().expect("read");
    assert!(read.enumerate_related(2, 1, None).expect("enumerate").is_empty());
}

#[test]
fn test_torn_header_falls_back_to_previous_commit() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(52, cfg);
    commit_relationships(
        &store,
        &[relationship(1, 1, 0, 10), relationship(2, 1, 0, 20)],
    );
    let newest = store.head();
    assert_eq!(newest.transaction_id, 2);
    drop(store);

    // Half-written header: right type, wrong checksum.
    let mut torn = Page::with_type(PageType::TransactionHeader);
    torn.write_u64(64, 0xDEAD_BEEF);
    disk.overwrite_durable(newest.slot(), torn);

    let store = reopen(&disk, cfg);
    assert_eq!(store.head().transaction_id, 1);
    let read = store.read().expect("read");
    assert_eq!(read.enumerate_related(1, 1, None).expect("enumerate").len(), 1);
    assert!(read.enumerate_related(2, 1, None).expect("enumerate").is_empty());
}

#[test]
fn test_both_headers_damaged_refuses_to_open() {
    let cfg = config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(53, cfg);
    commit_relationships(&store, &[relationship(1, 1, 0, 10)]);
    drop(store);

    disk.flip_byte(0, 100);
    disk.flip_byte(1, 100);
    let result = crate::storage::Store::open_with_storage(Box::new(disk), cfg);
    assert!(matches!(result, Err(StoreError::Page(_))));
}
