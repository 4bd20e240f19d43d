//! Store transactions.
//!
//! A [`WriteTransaction`] moves through
//! `Mutating -> Committing -> Committed | Aborted`. Dropping one before
//! commit aborts it. A page store error during a mutation aborts it as well;
//! every later call then fails with [`StoreError::TransactionClosed`].
//!
//! A [`ReadTransaction`] is pinned to one commit for its whole lifetime.

use std::ops::Bound;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::PersistenceStrategy;

use crate::storage::cache::PageCacheControl;
use crate::storage::header::{NamedRoots, TransactionHeader, TransactionId};
use crate::storage::indexes::{
    GraphId, GraphIndex, GraphIndexEntry, PredicateId, RelatedKey, RelatedResourceIndex,
    RelationTarget, ResourceId, ResourceRelationship,
};
use crate::storage::page::PageId;
use crate::storage::page_store::{PageTransaction, Snapshot};
use crate::storage::statistics::{StatisticsBuilder, StatisticsLog, StoreStatisticsRecord};
use crate::storage::store::{
    GRAPH_INDEX_ROOT, RELATED_RESOURCE_INDEX_ROOT, RESERVED_ROOTS, STATISTICS_ROOT, Store,
    StoreError,
};

/// Lifecycle of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Mutating,
    Committing,
    Committed,
    Aborted,
}

/// The single write transaction of a store.
pub struct WriteTransaction<'a> {
    store: &'a Store,
    pages: Option<PageTransaction<'a>>,
    base: TransactionHeader,
    state: TransactionState,
    graphs: GraphIndex,
    related: RelatedResourceIndex,
    statistics: StatisticsBuilder,
    statistics_log: StatisticsLog,
    extra_roots: NamedRoots,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn begin(
        store: &'a Store,
        pages: PageTransaction<'a>,
        graphs: &GraphIndex,
    ) -> Result<Self, StoreError> {
        let base = pages.base().clone();
        let related = RelatedResourceIndex::open(
            base.root(RELATED_RESOURCE_INDEX_ROOT),
            store.config().max_keys_per_node,
            Arc::clone(store.related_cache()),
        );
        let statistics_log = StatisticsLog::new(base.root(STATISTICS_ROOT));
        let statistics = statistics_log
            .latest_readable(&pages)?
            .map(|record| StatisticsBuilder::from_record(&record))
            .unwrap_or_default();
        let extra_roots = base
            .roots
            .iter()
            .filter(|(name, _)| !RESERVED_ROOTS.contains(&name.as_str()))
            .map(|(name, page_id)| (name.clone(), *page_id))
            .collect();

        debug!(base = base.transaction_id, "began write transaction");
        Ok(Self {
            store,
            pages: Some(pages),
            base,
            state: TransactionState::Mutating,
            graphs: graphs.clone(),
            related,
            statistics,
            statistics_log,
            extra_roots,
        })
    }

    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// The commit this transaction started from.
    #[must_use]
    pub const fn base(&self) -> &TransactionHeader {
        &self.base
    }

    /// The id this transaction will commit as.
    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.base.transaction_id + 1
    }

    /// The page transaction, for components that keep their own trees.
    pub fn pages(&mut self) -> Result<&mut PageTransaction<'a>, StoreError> {
        if self.state != TransactionState::Mutating {
            return Err(StoreError::TransactionClosed);
        }
        self.pages.as_mut().ok_or(StoreError::TransactionClosed)
    }

    /// Run a mutation, aborting the transaction if the page store fails.
    fn mutate<T, E, F>(&mut self, op: F) -> Result<T, StoreError>
    where
        E: Into<StoreError>,
        F: FnOnce(&mut PageTransaction<'a>, &mut GraphIndex, &mut RelatedResourceIndex) -> Result<T, E>,
    {
        if self.state != TransactionState::Mutating {
            return Err(StoreError::TransactionClosed);
        }
        let Some(pages) = self.pages.as_mut() else {
            return Err(StoreError::TransactionClosed);
        };
        match op(pages, &mut self.graphs, &mut self.related) {
            Ok(value) => Ok(value),
            Err(e) => {
                let e = e.into();
                if let Some(cause) = e.page_store_error() {
                    warn!(error = %cause, "aborting write transaction after storage error");
                    self.state = TransactionState::Aborted;
                    self.pages = None;
                }
                Err(e)
            }
        }
    }

    /// Return the id of `uri`, registering it if it is new.
    pub fn assert_graph_id(&mut self, uri: &str) -> Result<GraphId, StoreError> {
        self.mutate(|_, graphs, _| graphs.assert_graph_id(uri))
    }

    #[must_use]
    pub fn try_find_graph_id(&self, uri: &str) -> Option<GraphId> {
        self.graphs.try_find_graph_id(uri)
    }

    #[must_use]
    pub fn get_graph_uri(&self, id: GraphId) -> Option<&str> {
        self.graphs.get_graph_uri(id)
    }

    /// Tombstone a graph.
    pub fn delete_graph(&mut self, id: GraphId) -> Result<(), StoreError> {
        self.mutate(|_, graphs, _| graphs.delete_graph(id))
    }

    #[must_use]
    pub const fn graphs(&self) -> &GraphIndex {
        &self.graphs
    }

    /// Returns false if the relationship was already recorded.
    pub fn add_related_resource(&mut self, relationship: &ResourceRelationship) -> Result<bool, StoreError> {
        self.mutate(|pages, _, related| related.add_related_resource(pages, relationship))
    }

    /// Returns false if the relationship was not recorded.
    pub fn delete_related_resource(
        &mut self,
        relationship: &ResourceRelationship,
    ) -> Result<bool, StoreError> {
        self.mutate(|pages, _, related| related.delete_related_resource(pages, relationship))
    }

    /// Store a new value set under `key` in the related resource index.
    pub fn insert_related(&mut self, key: RelatedKey, targets: &[RelationTarget]) -> Result<PageId, StoreError> {
        self.mutate(|pages, _, related| related.insert(pages, key, targets))
    }

    /// Relationships as seen by this transaction, including its own changes.
    pub fn enumerate_related(
        &mut self,
        resource_id: ResourceId,
        predicate_id: PredicateId,
        graph_id: Option<GraphId>,
    ) -> Result<Vec<ResourceRelationship>, StoreError> {
        self.mutate(|pages, _, related| {
            related.enumerate_related(&*pages, resource_id, predicate_id, graph_id)
        })
    }

    /// Count `count` new triples with `predicate`.
    pub fn record_triples_added(&mut self, predicate: &str, count: u64) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.statistics.add(predicate, count);
        Ok(())
    }

    /// Count `count` removed triples with `predicate`.
    pub fn record_triples_removed(&mut self, predicate: &str, count: u64) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.statistics.remove(predicate, count);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.state == TransactionState::Mutating && self.pages.is_some() {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }

    /// The statistics this transaction will commit.
    #[must_use]
    pub fn pending_statistics(&self) -> StoreStatisticsRecord {
        self.statistics.build(self.transaction_id())
    }

    /// Publish an extra root with this commit.
    pub fn set_root(&mut self, name: &str, page_id: PageId) -> Result<(), StoreError> {
        if RESERVED_ROOTS.contains(&name) {
            return Err(StoreError::ReservedRoot(name.to_string()));
        }
        self.ensure_open()?;
        self.extra_roots.insert(name.to_string(), page_id);
        Ok(())
    }

    /// An extra root as of this transaction (0 if absent).
    #[must_use]
    pub fn root(&self, name: &str) -> PageId {
        self.extra_roots.get(name).copied().unwrap_or(0)
    }

    /// Write the indexes and statistics and publish every root at once.
    pub fn commit(mut self) -> Result<TransactionHeader, StoreError> {
        if self.state != TransactionState::Mutating {
            return Err(StoreError::TransactionClosed);
        }
        let Some(mut pages) = self.pages.take() else {
            return Err(StoreError::TransactionClosed);
        };
        self.state = TransactionState::Committing;

        let result = self
            .write_roots(&mut pages)
            .and_then(|roots| pages.commit(roots).map_err(StoreError::from));
        match result {
            Ok(header) => {
                self.state = TransactionState::Committed;
                let graphs = std::mem::replace(&mut self.graphs, GraphIndex::new(None));
                self.store.publish_graphs(header.transaction_id, graphs);
                Ok(header)
            }
            Err(e) => {
                self.state = TransactionState::Aborted;
                Err(e)
            }
        }
    }

    fn write_roots(&mut self, pages: &mut PageTransaction<'a>) -> Result<NamedRoots, StoreError> {
        let graph_root = self.graphs.flush(pages)?;
        let record = self.statistics.build(self.transaction_id());
        let statistics_root = match self.store.strategy() {
            PersistenceStrategy::AppendOnly => self.statistics_log.append(pages, &record)?,
            PersistenceStrategy::Rewrite => self.statistics_log.replace(pages, &record)?,
        };

        let mut roots = self.extra_roots.clone();
        roots.insert(GRAPH_INDEX_ROOT.to_string(), graph_root);
        roots.insert(
            RELATED_RESOURCE_INDEX_ROOT.to_string(),
            self.related.root(),
        );
        roots.insert(STATISTICS_ROOT.to_string(), statistics_root);
        Ok(roots)
    }

    /// Discard every change.
    pub fn abort(mut self) {
        self.state = TransactionState::Aborted;
        self.pages = None;
        debug!(base = self.base.transaction_id, "aborted write transaction");
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Mutating | TransactionState::Committing
        ) {
            debug!(
                base = self.base.transaction_id,
                "dropped uncommitted write transaction"
            );
            self.state = TransactionState::Aborted;
        }
    }
}

/// A read-only view of one commit.
pub struct ReadTransaction {
    snapshot: Snapshot,
    graphs: Arc<GraphIndex>,
    related: RelatedResourceIndex,
    statistics: StatisticsLog,
}

impl ReadTransaction {
    pub(crate) fn new(snapshot: Snapshot, graphs: Arc<GraphIndex>, store: &Store) -> Self {
        let related = RelatedResourceIndex::open(
            snapshot.root(RELATED_RESOURCE_INDEX_ROOT),
            store.config().max_keys_per_node,
            Arc::clone(store.related_cache()),
        );
        let statistics = StatisticsLog::new(snapshot.root(STATISTICS_ROOT));
        Self {
            snapshot,
            graphs,
            related,
            statistics,
        }
    }

    #[must_use]
    pub const fn header(&self) -> &TransactionHeader {
        self.snapshot.header()
    }

    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.snapshot.transaction_id()
    }

    /// The pinned snapshot, for components that keep their own trees.
    #[must_use]
    pub const fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// A root as of this commit (0 if absent).
    #[must_use]
    pub fn root(&self, name: &str) -> PageId {
        self.snapshot.root(name)
    }

    #[must_use]
    pub fn graphs(&self) -> &GraphIndex {
        &self.graphs
    }

    #[must_use]
    pub fn try_find_graph_id(&self, uri: &str) -> Option<GraphId> {
        self.graphs.try_find_graph_id(uri)
    }

    #[must_use]
    pub fn get_graph_uri(&self, id: GraphId) -> Option<&str> {
        self.graphs.get_graph_uri(id)
    }

    /// Every graph, tombstones included.
    pub fn enumerate_graphs(&self) -> impl Iterator<Item = &GraphIndexEntry> {
        self.graphs.enumerate_entries()
    }

    #[must_use]
    pub const fn related(&self) -> &RelatedResourceIndex {
        &self.related
    }

    pub fn lookup_related(&self, key: RelatedKey) -> Result<Option<Vec<RelationTarget>>, StoreError> {
        Ok(self.related.lookup(&self.snapshot, key)?)
    }

    pub fn enumerate_related(
        &self,
        resource_id: ResourceId,
        predicate_id: PredicateId,
        graph_id: Option<GraphId>,
    ) -> Result<Vec<ResourceRelationship>, StoreError> {
        Ok(self
            .related
            .enumerate_related(&self.snapshot, resource_id, predicate_id, graph_id)?)
    }

    /// Every relationship with `predicate_id`, ordered by resource.
    pub fn enumerate_predicate(
        &self,
        predicate_id: PredicateId,
    ) -> impl Iterator<Item = Result<ResourceRelationship, StoreError>> + '_ {
        self.related
            .enumerate_predicate(&self.snapshot, predicate_id)
            .map(|item| item.map_err(StoreError::from))
    }

    /// Keys of the related resource index between two bounds.
    pub fn scan_related(
        &self,
        low: Bound<RelatedKey>,
        high: Bound<RelatedKey>,
    ) -> impl Iterator<Item = Result<(RelatedKey, Vec<RelationTarget>), StoreError>> + '_ {
        self.related
            .range_scan(&self.snapshot, low, high)
            .map(|item| item.map_err(StoreError::from))
    }

    /// Statistics as of this commit.
    pub fn statistics(&self) -> Result<Option<StoreStatisticsRecord>, StoreError> {
        Ok(self.statistics.latest(&self.snapshot)?)
    }

    /// Statistics of this commit and every earlier one still reachable,
    /// newest first. Rewrite stores keep only the latest record.
    pub fn statistics_history(&self) -> Vec<Result<StoreStatisticsRecord, StoreError>> {
        self.statistics
            .records(&self.snapshot)
            .map(|item| item.map_err(StoreError::from))
            .collect()
    }

    /// Load up to `max_pages` pages of the related resource index into the
    /// shared cache.
    pub fn preload_related(&self, max_pages: usize) -> Result<usize, StoreError> {
        Ok(self.related.preload(&self.snapshot, max_pages)?)
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("transaction_id", &self.transaction_id())
            .field("graphs", &self.graphs.len())
            .finish_non_exhaustive()
    }
}
