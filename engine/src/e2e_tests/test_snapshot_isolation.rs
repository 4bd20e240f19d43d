//! Readers keep seeing the commit they started on.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;

#[test]
fn test_reader_ignores_later_commits() {
    let (store, _disk) = memory_store(40, small_config(PersistenceStrategy::AppendOnly));
    commit_relationships(&store, &[relationship(1, 1, 0, 10)]);

    let before = store.read().expect("read");
    assert_eq!(before.transaction_id(), 1);

    let mut txn = store.begin_write().expect("begin");
    for related in 11..40 {
        txn.add_related_resource(&relationship(1, 1, 0, related))
            .expect("add");
    }
    for resource in 2..30 {
        txn.add_related_resource(&relationship(resource, 1, 0, 1))
            .expect("add");
    }
    txn.delete_related_resource(&relationship(1, 1, 0, 10))
        .expect("delete");

    // Uncommitted changes are invisible to readers.
    let during = store.read().expect("read");
    assert_eq!(during.transaction_id(), 1);
    txn.commit().expect("commit");

    for reader in [&before, &during] {
        let found = reader.enumerate_related(1, 1, None).expect("enumerate");
        assert_eq!(found, vec![relationship(1, 1, 0, 10)]);
        assert_eq!(reader.enumerate_predicate(1).count(), 1);
    }

    let after = store.read().expect("read");
    assert_eq!(after.transaction_id(), 2);
    assert_eq!(after.enumerate_related(1, 1, None).expect("enumerate").len(), 29);
    assert_eq!(after.enumerate_predicate(1).count(), 29 + 28);
}

#[test]
fn test_aborted_transaction_leaves_no_trace() {
    let (store, _disk) = memory_store(41, small_config(PersistenceStrategy::AppendOnly));
    commit_relationships(&store, &[relationship(1, 1, 0, 10)]);
    let head = store.head();

    let mut txn = store.begin_write().expect("begin");
    txn.add_related_resource(&relationship(2, 1, 0, 10)).expect("add");
    txn.assert_graph_id("urn:aborted").expect("assert");
    txn.record_triples_added("p", 1).expect("record");
    txn.abort();

    assert_eq!(store.head(), head);
    let read = store.read().expect("read");
    assert!(read.enumerate_related(2, 1, None).expect("enumerate").is_empty());
    assert_eq!(read.try_find_graph_id("urn:aborted"), None);
}

#[test]
fn test_write_transaction_sees_own_changes() {
    let (store, _disk) = memory_store(42, config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");
    assert!(txn.add_related_resource(&relationship(5, 6, 0, 7)).expect("add"));
    assert!(!txn.add_related_resource(&relationship(5, 6, 0, 7)).expect("add again"));
    assert_eq!(
        txn.enumerate_related(5, 6, None).expect("enumerate"),
        vec![relationship(5, 6, 0, 7)]
    );
    assert!(txn.delete_related_resource(&relationship(5, 6, 0, 7)).expect("delete"));
    assert!(!txn.delete_related_resource(&relationship(5, 6, 0, 7)).expect("delete again"));
    assert!(txn.enumerate_related(5, 6, None).expect("enumerate").is_empty());
}
