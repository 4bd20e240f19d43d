//! Stores backed by a real file.

use crate::config::{PersistenceStrategy, StoreConfig};
use crate::e2e_tests::helpers::*;
use crate::storage::{PageStoreError, Store, StoreError};
use crate::testing::new_file_store;

#[test]
fn test_file_store_survives_reopen() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (dir, store) = new_file_store(cfg).expect("create");
    let path = dir.path().join("store.db");

    let mut txn = store.begin_write().expect("begin");
    let graph = txn.assert_graph_id("urn:file").expect("assert");
    for resource in 0..100 {
        txn.add_related_resource(&relationship(resource, 1, graph, resource + 1))
            .expect("add");
    }
    txn.record_triples_added("p", 100).expect("record");
    txn.commit().expect("commit");
    drop(store);

    // The recorded strategy wins over the configured one.
    let store = Store::open(&path, config(PersistenceStrategy::Rewrite)).expect("open");
    assert_eq!(store.strategy(), PersistenceStrategy::AppendOnly);
    let read = store.read().expect("read");
    assert_eq!(read.enumerate_predicate(1).count(), 100);
    assert_eq!(
        read.enumerate_related(42, 1, Some(graph)).expect("enumerate"),
        vec![relationship(42, 1, graph, 43)]
    );
    assert!(read.enumerate_related(42, 1, Some(graph + 1)).expect("enumerate").is_empty());
}

#[test]
fn test_create_refuses_existing_file() {
    let (dir, store) = new_file_store(StoreConfig::default()).expect("create");
    drop(store);
    let result = Store::create(&dir.path().join("store.db"), StoreConfig::default());
    assert!(matches!(
        result,
        Err(StoreError::Page(PageStoreError::AlreadyExists(_)))
    ));

    let store = Store::open_or_create(&dir.path().join("store.db"), StoreConfig::default())
        .expect("open existing");
    assert_eq!(store.head().transaction_id, 0);
}
