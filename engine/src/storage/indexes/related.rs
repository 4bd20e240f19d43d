//! Related resource index.
//!
//! Answers "which resources are related to X via predicate P" without a full
//! scan. Entries are partitioned by predicate so every relationship of one
//! predicate is a contiguous key range.
//!
//! # Key Format
//!
//! Keys are 16 bytes: `(predicate_id: u64, resource_id: u64)`, big-endian.
//!
//! # Value Format
//!
//! A sorted, duplicate-free list of 12-byte records
//! `(related_resource: u64, graph_id: u32)`, big-endian.
//!
//! # Page Cache
//!
//! Reads go through a [`PageCache`] that the caller fills with
//! [`PageCacheControl::preload`] and empties with
//! [`PageCacheControl::flush_cache`].

use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::storage::btree::{BPlusTree, RangeScan, TreeError, TreeLayout};
use crate::storage::cache::{CachedReader, PageCache, PageCacheControl};
use crate::storage::indexes::graph::GraphId;
use crate::storage::page::{NULL_PAGE, PageId};
use crate::storage::page_store::{PageRead, PageStoreError, PageWrite};

/// Dictionary id of an RDF resource.
pub type ResourceId = u64;

/// Dictionary id of a predicate.
pub type PredicateId = u64;

/// Size of a related resource index key.
pub const RELATED_KEY_SIZE: usize = 16;

/// Size of one encoded [`RelationTarget`].
const TARGET_SIZE: usize = 12;

/// A `(resource, predicate, graph)` triple pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelatedResource {
    pub resource_id: ResourceId,
    pub predicate_id: PredicateId,
    pub graph_id: GraphId,
}

/// A [`RelatedResource`] together with the resource it points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceRelationship {
    pub resource_id: ResourceId,
    pub predicate_id: PredicateId,
    pub graph_id: GraphId,
    pub related_resource: ResourceId,
}

impl ResourceRelationship {
    #[must_use]
    pub const fn new(related: RelatedResource, related_resource: ResourceId) -> Self {
        Self {
            resource_id: related.resource_id,
            predicate_id: related.predicate_id,
            graph_id: related.graph_id,
            related_resource,
        }
    }

    #[must_use]
    pub const fn related(&self) -> RelatedResource {
        RelatedResource {
            resource_id: self.resource_id,
            predicate_id: self.predicate_id,
            graph_id: self.graph_id,
        }
    }

    const fn key(&self) -> RelatedKey {
        RelatedKey {
            predicate_id: self.predicate_id,
            resource_id: self.resource_id,
        }
    }

    const fn target(&self) -> RelationTarget {
        RelationTarget {
            related_resource: self.related_resource,
            graph_id: self.graph_id,
        }
    }
}

/// Key of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelatedKey {
    pub predicate_id: PredicateId,
    pub resource_id: ResourceId,
}

impl RelatedKey {
    #[must_use]
    pub const fn new(predicate_id: PredicateId, resource_id: ResourceId) -> Self {
        Self {
            predicate_id,
            resource_id,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; RELATED_KEY_SIZE] {
        let mut key = [0u8; RELATED_KEY_SIZE];
        key[..8].copy_from_slice(&self.predicate_id.to_be_bytes());
        key[8..].copy_from_slice(&self.resource_id.to_be_bytes());
        key
    }

    /// Returns `None` unless exactly [`RELATED_KEY_SIZE`] bytes are given.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RELATED_KEY_SIZE {
            return None;
        }
        let mut predicate = [0u8; 8];
        let mut resource = [0u8; 8];
        predicate.copy_from_slice(&bytes[..8]);
        resource.copy_from_slice(&bytes[8..]);
        Some(Self::new(
            u64::from_be_bytes(predicate),
            u64::from_be_bytes(resource),
        ))
    }
}

/// One member of a key's value set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationTarget {
    pub related_resource: ResourceId,
    pub graph_id: GraphId,
}

fn encode_targets(targets: &[RelationTarget]) -> Vec<u8> {
    let mut sorted = targets.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut value = Vec::with_capacity(sorted.len() * TARGET_SIZE);
    for target in sorted {
        value.extend_from_slice(&target.related_resource.to_be_bytes());
        value.extend_from_slice(&target.graph_id.to_be_bytes());
    }
    value
}

fn decode_targets(key: RelatedKey, value: &[u8]) -> Result<Vec<RelationTarget>, RelatedIndexError> {
    if value.len() % TARGET_SIZE != 0 {
        return Err(RelatedIndexError::Corruption {
            key,
            reason: format!("value of {} bytes is not a list of targets", value.len()),
        });
    }
    Ok(value
        .chunks_exact(TARGET_SIZE)
        .map(|chunk| {
            let mut resource = [0u8; 8];
            let mut graph = [0u8; 4];
            resource.copy_from_slice(&chunk[..8]);
            graph.copy_from_slice(&chunk[8..]);
            RelationTarget {
                related_resource: u64::from_be_bytes(resource),
                graph_id: u32::from_be_bytes(graph),
            }
        })
        .collect())
}

/// Predicate-partitioned index of relationships.
#[derive(Debug, Clone)]
pub struct RelatedResourceIndex {
    tree: BPlusTree,
    cache: Arc<PageCache>,
}

impl RelatedResourceIndex {
    /// Open the index stored under `root` (0 for an empty index).
    #[must_use]
    pub fn open(root: PageId, max_keys_per_node: Option<usize>, cache: Arc<PageCache>) -> Self {
        let layout = TreeLayout::variable(RELATED_KEY_SIZE).with_max_keys(max_keys_per_node);
        Self {
            tree: BPlusTree::new(layout, root),
            cache,
        }
    }

    #[must_use]
    pub const fn root(&self) -> PageId {
        self.tree.root()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.root() == NULL_PAGE
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Store a new value set under `key`.
    ///
    /// Fails with [`TreeError::DuplicateKey`] if the key already has one.
    pub fn insert<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        key: RelatedKey,
        targets: &[RelationTarget],
    ) -> Result<PageId, RelatedIndexError> {
        Ok(self
            .tree
            .insert(pages, &key.to_bytes(), &encode_targets(targets))?)
    }

    /// The value set stored under `key`.
    pub fn lookup<R: PageRead>(
        &self,
        pages: &R,
        key: RelatedKey,
    ) -> Result<Option<Vec<RelationTarget>>, RelatedIndexError> {
        let reader = CachedReader::new(pages, &self.cache);
        match self.tree.lookup(&reader, &key.to_bytes())? {
            Some(value) => Ok(Some(decode_targets(key, &value)?)),
            None => Ok(None),
        }
    }

    /// Iterate over the keys between two bounds in ascending order.
    #[must_use]
    pub fn range_scan<'a, R: PageRead>(
        &'a self,
        pages: &'a R,
        low: Bound<RelatedKey>,
        high: Bound<RelatedKey>,
    ) -> RelatedScan<'a, R> {
        let low = low.map(|key| key.to_bytes());
        let high = high.map(|key| key.to_bytes());
        let inner = self.tree.range_scan(
            CachedReader::new(pages, &self.cache),
            low.as_ref().map(|key| key.as_slice()),
            high.as_ref().map(|key| key.as_slice()),
        );
        RelatedScan { inner }
    }

    /// Record that `relationship.resource_id` relates to
    /// `relationship.related_resource`. Returns false if already recorded.
    ///
    /// The key's value set is replaced by deleting and re-inserting it.
    pub fn add_related_resource<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        relationship: &ResourceRelationship,
    ) -> Result<bool, RelatedIndexError> {
        let key = relationship.key();
        let existing = self.lookup(&*pages, key)?;
        let mut targets = existing.clone().unwrap_or_default();
        if targets.contains(&relationship.target()) {
            return Ok(false);
        }
        targets.push(relationship.target());

        let mut tree = self.tree;
        if existing.is_some() {
            tree.delete(pages, &key.to_bytes())?;
        }
        tree.insert(pages, &key.to_bytes(), &encode_targets(&targets))?;
        self.tree = tree;
        Ok(true)
    }

    /// Remove a relationship. Returns false if it was not recorded.
    pub fn delete_related_resource<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        relationship: &ResourceRelationship,
    ) -> Result<bool, RelatedIndexError> {
        let key = relationship.key();
        let Some(mut targets) = self.lookup(&*pages, key)? else {
            return Ok(false);
        };
        let before = targets.len();
        targets.retain(|target| *target != relationship.target());
        if targets.len() == before {
            return Ok(false);
        }

        let mut tree = self.tree;
        tree.delete(pages, &key.to_bytes())?;
        if !targets.is_empty() {
            tree.insert(pages, &key.to_bytes(), &encode_targets(&targets))?;
        }
        self.tree = tree;
        Ok(true)
    }

    /// Resources related to `resource_id` via `predicate_id`, optionally
    /// restricted to one graph.
    pub fn enumerate_related<R: PageRead>(
        &self,
        pages: &R,
        resource_id: ResourceId,
        predicate_id: PredicateId,
        graph_id: Option<GraphId>,
    ) -> Result<Vec<ResourceRelationship>, RelatedIndexError> {
        let key = RelatedKey::new(predicate_id, resource_id);
        let targets = self.lookup(pages, key)?.unwrap_or_default();
        Ok(targets
            .into_iter()
            .filter(|target| graph_id.is_none_or(|graph| graph == target.graph_id))
            .map(|target| relationship(key, target))
            .collect())
    }

    /// Every relationship with `predicate_id`, ordered by resource.
    pub fn enumerate_predicate<'a, R: PageRead>(
        &'a self,
        pages: &'a R,
        predicate_id: PredicateId,
    ) -> impl Iterator<Item = Result<ResourceRelationship, RelatedIndexError>> + 'a {
        self.range_scan(
            pages,
            Bound::Included(RelatedKey::new(predicate_id, 0)),
            Bound::Included(RelatedKey::new(predicate_id, ResourceId::MAX)),
        )
        .flat_map(|item| match item {
            Ok((key, targets)) => targets
                .into_iter()
                .map(|target| Ok(relationship(key, target)))
                .collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })
    }

    /// Number of keys.
    pub fn key_count<R: PageRead>(&self, pages: &R) -> Result<usize, RelatedIndexError> {
        Ok(self.tree.len(&CachedReader::new(pages, &self.cache))?)
    }

    /// Number of pages in the tree, overflow chains included.
    pub fn page_count<R: PageRead>(&self, pages: &R) -> Result<usize, PageStoreError> {
        self.tree.page_count(pages)
    }
}

const fn relationship(key: RelatedKey, target: RelationTarget) -> ResourceRelationship {
    ResourceRelationship {
        resource_id: key.resource_id,
        predicate_id: key.predicate_id,
        graph_id: target.graph_id,
        related_resource: target.related_resource,
    }
}

impl PageCacheControl for RelatedResourceIndex {
    /// Load the tree breadth first, nodes before overflow chains.
    fn preload<R: PageRead>(&self, pages: &R, max_pages: usize) -> Result<usize, PageStoreError> {
        let loaded = self.tree.walk(pages, max_pages, |page_id, page| {
            self.cache.insert(page_id, Arc::clone(page));
        })?;
        debug!(loaded, max_pages, "preloaded related resource index");
        Ok(loaded)
    }

    fn flush_cache(&self) {
        self.cache.clear();
    }
}

/// Lazy iterator over a key range of a [`RelatedResourceIndex`].
pub struct RelatedScan<'a, R> {
    inner: RangeScan<CachedReader<'a, R>>,
}

impl<R: PageRead> Iterator for RelatedScan<'_, R> {
    type Item = Result<(RelatedKey, Vec<RelationTarget>), RelatedIndexError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        Some(item.map_err(RelatedIndexError::from).and_then(|(key, value)| {
            let key = RelatedKey::from_bytes(&key).ok_or_else(|| RelatedIndexError::Corruption {
                key: RelatedKey::new(0, 0),
                reason: format!("key of {} bytes", key.len()),
            })?;
            Ok((key, decode_targets(key, &value)?))
        }))
    }
}

/// Errors that can occur during related resource index operations.
#[derive(Debug)]
pub enum RelatedIndexError {
    /// A stored value could not be decoded.
    Corruption { key: RelatedKey, reason: String },
    /// B+Tree operation failed.
    Tree(TreeError),
}

impl std::fmt::Display for RelatedIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corruption { key, reason } => write!(
                f,
                "corrupt related resource entry ({}, {}): {reason}",
                key.predicate_id, key.resource_id
            ),
            Self::Tree(e) => write!(f, "B+Tree error: {e}"),
        }
    }
}

impl std::error::Error for RelatedIndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::Corruption { .. } => None,
        }
    }
}

impl From<TreeError> for RelatedIndexError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}
