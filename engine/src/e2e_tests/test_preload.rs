//! Preloading and flushing the related resource index cache.

use crate::config::PersistenceStrategy;
use crate::e2e_tests::helpers::*;
use crate::storage::PageCacheControl;

#[test]
fn test_preload_stops_at_tree_size() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(30, cfg);

    let mut txn = store.begin_write().expect("begin");
    for resource in 1..=5 {
        txn.add_related_resource(&relationship(resource, 1, 0, 100 + resource))
            .expect("add");
    }
    txn.commit().expect("commit");
    drop(store);

    // Root plus two leaves.
    let store = reopen(&disk, cfg);
    let read = store.read().expect("read");
    assert_eq!(read.related().page_count(read.snapshot()).expect("pages"), 3);

    assert_eq!(read.preload_related(10).expect("preload"), 3);
    assert_eq!(read.related().cache().len(), 3);

    read.related().flush_cache();
    assert!(read.related().cache().is_empty());
    assert_eq!(read.preload_related(1).expect("preload"), 1);
    assert_eq!(read.related().cache().len(), 1);
}

#[test]
fn test_preload_on_open() {
    let cfg = small_config(PersistenceStrategy::AppendOnly);
    let (store, disk) = memory_store(31, cfg);
    let rels: Vec<_> = (1..=5).map(|r| relationship(r, 1, 0, r * 10)).collect();
    commit_relationships(&store, &rels);
    drop(store);

    let preloading = crate::config::StoreConfig {
        preload_pages: 2,
        ..cfg
    };
    let store = reopen(&disk, preloading);
    let read = store.read().expect("read");
    assert_eq!(read.related().cache().len(), 2);

    // Cached and uncached pages answer alike.
    for r in &rels {
        let found = read
            .enumerate_related(r.resource_id, r.predicate_id, None)
            .expect("enumerate");
        assert_eq!(found, vec![*r]);
    }

    store.flush_related_cache();
    assert!(read.related().cache().is_empty());
}
