//! Triple store storage engine.
//!
//! A single-file, copy-on-write storage engine for RDF triple workloads.
//!
//! # File Format
//!
//! The store is a sequence of 8KB checksummed pages:
//!
//! - Pages 0-1: Transaction header slots, written alternately
//! - Remaining pages: B+Tree nodes, overflow chains, statistics and commit
//!   records
//!
//! Pages are never modified after they are written. A commit writes new
//! pages, makes them durable, then writes a header naming the new roots.
//!
//! # Usage
//!
//! ```
//! use engine::config::StoreConfig;
//! use engine::storage::{ResourceRelationship, Store};
//!
//! let store = Store::in_memory(StoreConfig::default()).expect("create store");
//!
//! let mut txn = store.begin_write().expect("begin");
//! let graph_id = txn.assert_graph_id("urn:graph").expect("assert graph");
//! txn.add_related_resource(&ResourceRelationship {
//!     resource_id: 1,
//!     predicate_id: 2,
//!     graph_id,
//!     related_resource: 3,
//! })
//! .expect("add");
//! txn.commit().expect("commit");
//!
//! let read = store.read().expect("read");
//! assert_eq!(read.enumerate_related(1, 2, None).expect("enumerate").len(), 1);
//! ```

mod allocator;
pub mod btree;
mod cache;
mod file;
mod header;
pub mod indexes;
mod io;
mod memory;
mod overflow;
mod page;
mod page_store;
mod statistics;
mod store;
mod transaction;

pub use cache::{CachedReader, PageCache, PageCacheControl};
pub use file::{FileError, FileStorage};
pub use header::{HeaderError, NamedRoots, TransactionHeader, TransactionId};
pub use indexes::{
    GraphId, GraphIndex, GraphIndexEntry, GraphIndexError, PredicateId, RelatedIndexError,
    RelatedKey, RelatedResource, RelatedResourceIndex, RelationTarget, ResourceId,
    ResourceRelationship,
};
pub use io::{Storage, StorageError};
pub use memory::{FaultConfig, MemoryStorage, MemoryStorageStats};
pub use overflow::{OVERFLOW_DATA_PER_PAGE, OverflowRef};
pub use page::{NULL_PAGE, PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};
pub use page_store::{PageRead, PageStore, PageStoreError, PageTransaction, PageWrite, Snapshot};
pub use statistics::{
    StatisticsBuilder, StatisticsError, StatisticsLog, StatisticsRecords, StoreStatisticsRecord,
};
pub use store::{
    GRAPH_INDEX_ROOT, RELATED_RESOURCE_INDEX_ROOT, RESERVED_ROOTS, STATISTICS_ROOT, Store,
    StoreError,
};
pub use transaction::{ReadTransaction, TransactionState, WriteTransaction};
