//! Graph index.
//!
//! Maps named-graph IRIs to compact sequential ids. Ids start at 0, are
//! assigned in order and never reused. Deleting a graph leaves a tombstone so
//! its id keeps pointing at the same IRI.
//!
//! The whole registry is held in memory; the B+Tree is its durable form and
//! is only touched by [`GraphIndex::open`] and [`GraphIndex::flush`].
//!
//! # Key Format
//!
//! Keys are 4 bytes: `graph_id` (big-endian `u32`).
//!
//! # Value Format
//!
//! `flags: u8` (bit 0 = deleted) followed by the UTF-8 IRI.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

use tracing::debug;

use crate::storage::btree::{BPlusTree, TreeError, TreeLayout};
use crate::storage::page::{NULL_PAGE, PageId};
use crate::storage::page_store::{PageRead, PageWrite};

/// Identifier of a named graph.
pub type GraphId = u32;

/// Size of a graph index key.
pub const GRAPH_KEY_SIZE: usize = 4;

const DELETED_FLAG: u8 = 0x01;

/// One registered graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphIndexEntry {
    pub id: GraphId,
    pub uri: String,
    pub is_deleted: bool,
}

impl GraphIndexEntry {
    fn encode_value(&self) -> Vec<u8> {
        let mut value = Vec::with_capacity(1 + self.uri.len());
        value.push(if self.is_deleted { DELETED_FLAG } else { 0 });
        value.extend_from_slice(self.uri.as_bytes());
        value
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<Self, GraphIndexError> {
        let id_bytes: [u8; GRAPH_KEY_SIZE] =
            key.try_into().map_err(|_| GraphIndexError::Corruption {
                reason: format!("graph key of {} bytes", key.len()),
            })?;
        let id = GraphId::from_be_bytes(id_bytes);
        let Some((flags, uri)) = value.split_first() else {
            return Err(GraphIndexError::Corruption {
                reason: format!("graph {id} has an empty value"),
            });
        };
        let uri = String::from_utf8(uri.to_vec()).map_err(|_| GraphIndexError::Corruption {
            reason: format!("graph {id} has a non UTF-8 IRI"),
        })?;
        Ok(Self {
            id,
            uri,
            is_deleted: flags & DELETED_FLAG != 0,
        })
    }
}

/// Registry of named graphs.
#[derive(Debug, Clone)]
pub struct GraphIndex {
    tree: BPlusTree,
    /// Indexed by id.
    entries: Vec<GraphIndexEntry>,
    by_uri: HashMap<String, GraphId>,
    dirty: BTreeSet<GraphId>,
    /// Entries below this id are already in the tree.
    persisted: usize,
}

impl GraphIndex {
    /// An empty index.
    #[must_use]
    pub fn new(max_keys_per_node: Option<usize>) -> Self {
        Self {
            tree: BPlusTree::new(Self::layout(max_keys_per_node), NULL_PAGE),
            entries: Vec::new(),
            by_uri: HashMap::new(),
            dirty: BTreeSet::new(),
            persisted: 0,
        }
    }

    /// Load the index stored under `root`.
    pub fn open<R: PageRead>(
        pages: &R,
        root: PageId,
        max_keys_per_node: Option<usize>,
    ) -> Result<Self, GraphIndexError> {
        let mut index = Self::new(max_keys_per_node);
        index.tree = BPlusTree::new(index.tree.layout(), root);

        for item in index.tree.range_scan(pages, Bound::Unbounded, Bound::Unbounded) {
            let (key, value) = item?;
            let entry = GraphIndexEntry::decode(&key, &value)?;
            if entry.id as usize != index.entries.len() {
                return Err(GraphIndexError::Corruption {
                    reason: format!(
                        "graph ids are not dense: found {} at position {}",
                        entry.id,
                        index.entries.len()
                    ),
                });
            }
            index.by_uri.insert(entry.uri.clone(), entry.id);
            index.entries.push(entry);
        }
        index.persisted = index.entries.len();
        debug!(root, graphs = index.entries.len(), "opened graph index");
        Ok(index)
    }

    fn layout(max_keys_per_node: Option<usize>) -> TreeLayout {
        TreeLayout::variable(GRAPH_KEY_SIZE).with_max_keys(max_keys_per_node)
    }

    /// Root of the persisted form, as of the last [`flush`](Self::flush).
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.tree.root()
    }

    /// Return the id of `uri`, registering it if it is new.
    ///
    /// A tombstoned graph keeps its id; asserting it again does not revive it.
    pub fn assert_graph_id(&mut self, uri: &str) -> Result<GraphId, GraphIndexError> {
        if let Some(id) = self.by_uri.get(uri) {
            return Ok(*id);
        }
        let id = GraphId::try_from(self.entries.len()).map_err(|_| GraphIndexError::Exhausted)?;
        self.entries.push(GraphIndexEntry {
            id,
            uri: uri.to_string(),
            is_deleted: false,
        });
        self.by_uri.insert(uri.to_string(), id);
        self.dirty.insert(id);
        Ok(id)
    }

    #[must_use]
    pub fn try_find_graph_id(&self, uri: &str) -> Option<GraphId> {
        self.by_uri.get(uri).copied()
    }

    /// The IRI of a live graph.
    #[must_use]
    pub fn get_graph_uri(&self, id: GraphId) -> Option<&str> {
        self.entries
            .get(id as usize)
            .filter(|entry| !entry.is_deleted)
            .map(|entry| entry.uri.as_str())
    }

    /// Tombstone a graph. Deleting an already deleted graph is a no-op.
    pub fn delete_graph(&mut self, id: GraphId) -> Result<(), GraphIndexError> {
        let entry = self
            .entries
            .get_mut(id as usize)
            .ok_or(GraphIndexError::NotFound { id })?;
        if !entry.is_deleted {
            entry.is_deleted = true;
            self.dirty.insert(id);
        }
        Ok(())
    }

    /// Every entry in id order, tombstones included.
    pub fn enumerate_entries(&self) -> impl Iterator<Item = &GraphIndexEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when there are changes not yet written by [`flush`](Self::flush).
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write pending changes into the tree and return the new root.
    ///
    /// Entries that are already persisted are replaced by deleting and
    /// re-inserting them. On error the index is left as it was.
    pub fn flush<S: PageRead + PageWrite>(&mut self, pages: &mut S) -> Result<PageId, GraphIndexError> {
        if self.dirty.is_empty() {
            return Ok(self.tree.root());
        }

        let mut tree = self.tree;
        for id in &self.dirty {
            let entry = &self.entries[*id as usize];
            let key = id.to_be_bytes();
            if (*id as usize) < self.persisted {
                tree.delete(pages, &key)?;
            }
            tree.insert(pages, &key, &entry.encode_value())?;
        }

        debug!(
            flushed = self.dirty.len(),
            root = tree.root(),
            "flushed graph index"
        );
        self.tree = tree;
        self.dirty.clear();
        self.persisted = self.entries.len();
        Ok(self.tree.root())
    }
}

/// Errors that can occur during graph index operations.
#[derive(Debug)]
pub enum GraphIndexError {
    /// No graph has this id.
    NotFound { id: GraphId },
    /// Every graph id is in use.
    Exhausted,
    /// A stored entry could not be decoded.
    Corruption { reason: String },
    /// B+Tree operation failed.
    Tree(TreeError),
}

impl std::fmt::Display for GraphIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "graph {id} not found"),
            Self::Exhausted => write!(f, "graph ids exhausted"),
            Self::Corruption { reason } => write!(f, "corrupt graph index: {reason}"),
            Self::Tree(e) => write!(f, "B+Tree error: {e}"),
        }
    }
}

impl std::error::Error for GraphIndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TreeError> for GraphIndexError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}
