//! Copy-on-write B+Tree over the page store.
//!
//! # Structure
//!
//! - Internal nodes: separator keys and child page pointers
//! - Leaf nodes: sorted entries; values inline or in overflow chains
//!
//! Keys have a fixed size per tree. Values are either fixed-size or
//! variable-length, as described by a [`TreeLayout`]. Keys compare as raw
//! bytes, so numeric components are encoded big-endian.
//!
//! # Usage
//!
//! ```
//! use engine::config::PersistenceStrategy;
//! use engine::storage::btree::{BPlusTree, TreeLayout};
//! use engine::storage::{MemoryStorage, PageStore};
//!
//! let store = PageStore::create(Box::new(MemoryStorage::new(1)), PersistenceStrategy::AppendOnly)
//!     .expect("create store");
//! let mut txn = store.begin_write();
//! let mut tree = BPlusTree::new(TreeLayout::variable(8), 0);
//!
//! tree.insert(&mut txn, &5u64.to_be_bytes(), b"a").expect("insert");
//! assert_eq!(
//!     tree.lookup(&txn, &5u64.to_be_bytes()).expect("lookup"),
//!     Some(b"a".to_vec())
//! );
//! ```

mod node;
mod tree;

pub use node::{
    DATA_SPACE, InternalNode, LeafEntry, LeafNode, Node, Rebalanced, StoredValue, TreeLayout,
};
pub use tree::{BPlusTree, RangeScan, TreeError};
