//! Common helpers for end-to-end tests.

use crate::config::{PersistenceStrategy, StoreConfig};
use crate::storage::{GraphId, MemoryStorage, ResourceRelationship, Store};
use crate::testing::new_memory_store;

/// Node fanout small enough that a handful of keys spans several pages.
pub const SMALL_FANOUT: usize = 4;

#[must_use]
pub fn config(strategy: PersistenceStrategy) -> StoreConfig {
    StoreConfig {
        strategy,
        ..StoreConfig::default()
    }
}

#[must_use]
pub fn small_config(strategy: PersistenceStrategy) -> StoreConfig {
    StoreConfig {
        strategy,
        max_keys_per_node: Some(SMALL_FANOUT),
        ..StoreConfig::default()
    }
}

/// A store on a simulated disk, panicking on failure.
#[must_use]
#[allow(clippy::expect_used)]
pub fn memory_store(seed: u64, config: StoreConfig) -> (Store, MemoryStorage) {
    new_memory_store(seed, config).expect("Failed to create test store")
}

/// Reopen the store held by `disk`.
#[must_use]
#[allow(clippy::expect_used)]
pub fn reopen(disk: &MemoryStorage, config: StoreConfig) -> Store {
    Store::open_with_storage(Box::new(disk.clone()), config).expect("Failed to reopen test store")
}

#[must_use]
pub const fn relationship(
    resource_id: u64,
    predicate_id: u64,
    graph_id: GraphId,
    related_resource: u64,
) -> ResourceRelationship {
    ResourceRelationship {
        resource_id,
        predicate_id,
        graph_id,
        related_resource,
    }
}

/// Commit one relationship per call, each in its own transaction.
#[allow(clippy::expect_used)]
pub fn commit_relationships(store: &Store, relationships: &[ResourceRelationship]) {
    for r in relationships {
        let mut txn = store.begin_write().expect("begin");
        txn.add_related_resource(r).expect("add");
        txn.commit().expect("commit");
    }
}
