//! Index implementations for the storage engine.
//!
//! Both indexes are thin layers over [`BPlusTree`](crate::storage::btree::BPlusTree)
//! that only deal in integer ids:
//! - Graph index: `graph_id` -> graph IRI, with tombstones
//! - Related resource index: (`predicate_id`, `resource_id`) -> [(`related_resource`, `graph_id`)]

pub mod graph;
pub mod related;

pub use graph::{GRAPH_KEY_SIZE, GraphId, GraphIndex, GraphIndexEntry, GraphIndexError};
pub use related::{
    PredicateId, RELATED_KEY_SIZE, RelatedIndexError, RelatedKey, RelatedResource,
    RelatedResourceIndex, RelatedScan, RelationTarget, ResourceId, ResourceRelationship,
};
