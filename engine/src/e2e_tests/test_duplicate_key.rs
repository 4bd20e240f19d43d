//! Inserting a key twice names the leaf that already holds it.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::btree::{BPlusTree, TreeError, TreeLayout};
use crate::storage::{NULL_PAGE, RelatedIndexError, RelatedKey, RelationTarget, StoreError};

#[test]
fn test_duplicate_key_on_single_leaf() {
    let (store, _disk) = memory_store(1, config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");
    let pages = txn.pages().expect("pages");

    let mut tree = BPlusTree::new(TreeLayout::fixed(8, 1), NULL_PAGE);
    let leaf = tree.insert(pages, &5u64.to_be_bytes(), b"a").expect("insert");

    let err = tree
        .insert(pages, &5u64.to_be_bytes(), b"b")
        .expect_err("duplicate");
    assert!(matches!(err, TreeError::DuplicateKey { page_id } if page_id == leaf));
    assert_eq!(
        tree.lookup(&*pages, &5u64.to_be_bytes()).expect("lookup"),
        Some(b"a".to_vec())
    );
}

#[test]
fn test_duplicate_related_key_leaves_index_unchanged() {
    let (store, _disk) = memory_store(2, small_config(PersistenceStrategy::AppendOnly));
    let key = RelatedKey::new(7, 1);
    let targets = [RelationTarget {
        related_resource: 9,
        graph_id: 0,
    }];

    let mut txn = store.begin_write().expect("begin");
    txn.insert_related(key, &targets).expect("insert");
    let err = txn.insert_related(key, &[]).expect_err("duplicate");
    assert!(matches!(
        err,
        StoreError::Related(RelatedIndexError::Tree(TreeError::DuplicateKey { .. }))
    ));
    // A logical error does not close the transaction.
    txn.commit().expect("commit");

    let read = store.read().expect("read");
    assert_eq!(read.lookup_related(key).expect("lookup"), Some(targets.to_vec()));
}
