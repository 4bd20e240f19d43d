//! Scans return keys in ascending `(predicate, resource)` order.

use std::ops::Bound;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::RelatedKey;

#[test]
fn test_predicate_scan_is_sorted() {
    let (store, _disk) = memory_store(90, small_config(PersistenceStrategy::AppendOnly));
    let mut rels: Vec<_> = (0..300u64)
        .map(|i| relationship(i % 50, i % 3, 0, i))
        .collect();
    rels.shuffle(&mut StdRng::seed_from_u64(90));

    let mut txn = store.begin_write().expect("begin");
    for r in &rels {
        txn.add_related_resource(r).expect("add");
    }
    txn.commit().expect("commit");

    let read = store.read().expect("read");
    for predicate in 0..3 {
        let resources: Vec<_> = read
            .enumerate_predicate(predicate)
            .map(|r| r.expect("relationship").resource_id)
            .collect();
        assert_eq!(resources.len(), 100);
        assert!(resources.is_sorted());
    }

    let keys: Vec<_> = read
        .scan_related(Bound::Unbounded, Bound::Unbounded)
        .map(|item| item.expect("entry").0)
        .collect();
    assert_eq!(keys.len(), 150);
    assert!(keys.is_sorted());
}

#[test]
fn test_scan_bounds() {
    let (store, _disk) = memory_store(91, small_config(PersistenceStrategy::AppendOnly));
    let mut txn = store.begin_write().expect("begin");
    for resource in 0..40 {
        txn.add_related_resource(&relationship(resource, 7, 0, 1))
            .expect("add");
    }
    txn.commit().expect("commit");

    let read = store.read().expect("read");
    let resources = |low, high| -> Vec<u64> {
        read.scan_related(low, high)
            .map(|item| item.expect("entry").0.resource_id)
            .collect()
    };

    assert_eq!(
        resources(
            Bound::Included(RelatedKey::new(7, 10)),
            Bound::Excluded(RelatedKey::new(7, 14))
        ),
        vec![10, 11, 12, 13]
    );
    assert_eq!(
        resources(
            Bound::Excluded(RelatedKey::new(7, 37)),
            Bound::Unbounded
        ),
        vec![38, 39]
    );
    assert!(
        resources(
            Bound::Included(RelatedKey::new(8, 0)),
            Bound::Unbounded
        )
        .is_empty()
    );
}
