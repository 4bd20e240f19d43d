//! High-level store interface.
//!
//! A [`Store`] ties the page store and the indexes together. Every commit
//! publishes the roots of all indexes in one transaction header:
//!
//! - `graphIndexRoot`: the [`GraphIndex`]
//! - `relatedResourceIndexRoot`: the [`RelatedResourceIndex`](crate::storage::indexes::RelatedResourceIndex)
//! - `statisticsRoot`: the newest [`StoreStatisticsRecord`](crate::storage::statistics::StoreStatisticsRecord)
//!
//! plus any extra roots registered through
//! [`WriteTransaction::set_root`].

use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::config::{ConfigError, PersistenceStrategy, StoreConfig};
use crate::storage::btree::TreeError;
use crate::storage::cache::PageCache;
use crate::storage::file::FileStorage;
use crate::storage::header::{TransactionHeader, TransactionId};
use crate::storage::indexes::{GraphIndex, GraphIndexError, RelatedIndexError};
use crate::storage::io::Storage;
use crate::storage::memory::MemoryStorage;
use crate::storage::page_store::{PageRead, PageStore, PageStoreError};
use crate::storage::statistics::{StatisticsBuilder, StatisticsError, StatisticsLog};
use crate::storage::transaction::{ReadTransaction, WriteTransaction};

/// Root name of the graph index.
pub const GRAPH_INDEX_ROOT: &str = "graphIndexRoot";
/// Root name of the related resource index.
pub const RELATED_RESOURCE_INDEX_ROOT: &str = "relatedResourceIndexRoot";
/// Root name of the statistics log.
pub const STATISTICS_ROOT: &str = "statisticsRoot";

/// Root names managed by the store itself.
pub const RESERVED_ROOTS: [&str; 3] = [GRAPH_INDEX_ROOT, RELATED_RESOURCE_INDEX_ROOT, STATISTICS_ROOT];

/// The graph index of the newest commit that loaded or published one.
#[derive(Debug, Default)]
struct GraphCache {
    entry: Option<(TransactionId, Arc<GraphIndex>)>,
}

impl GraphCache {
    fn get(&self, transaction_id: TransactionId) -> Option<Arc<GraphIndex>> {
        self.entry
            .as_ref()
            .filter(|(cached, _)| *cached == transaction_id)
            .map(|(_, graphs)| Arc::clone(graphs))
    }

    fn set(&mut self, transaction_id: TransactionId, graphs: Arc<GraphIndex>) {
        self.entry = Some((transaction_id, graphs));
    }
}

/// A store instance.
///
/// This is the main entry point for working with the storage engine. It is
/// `Sync`: one write transaction and any number of read transactions may be
/// open at once from different threads.
pub struct Store {
    pages: Arc<PageStore>,
    config: StoreConfig,
    graphs: RwLock<GraphCache>,
    related_cache: Arc<PageCache>,
}

impl Store {
    /// Create a new store at the given path.
    ///
    /// The path must not already exist.
    pub fn create(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let storage = FileStorage::create(path).map_err(PageStoreError::from)?;
        info!(path = %path.display(), strategy = %config.strategy, "creating store");
        Self::create_with_storage(Box::new(storage), config)
    }

    /// Open an existing store at the given path.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let storage = FileStorage::open(path).map_err(PageStoreError::from)?;
        info!(path = %path.display(), "opening store");
        Self::open_with_storage(Box::new(storage), config)
    }

    /// Open an existing store or create a new one if it doesn't exist.
    pub fn open_or_create(path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    /// A store that lives in memory only.
    pub fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::create_with_storage(Box::new(MemoryStorage::new(0)), config)
    }

    /// Format an empty backend as a new store.
    pub fn create_with_storage(storage: Box<dyn Storage>, config: StoreConfig) -> Result<Self, StoreError> {
        let pages = PageStore::create(storage, config.strategy)?;
        Ok(Self::from_page_store(pages, config))
    }

    /// Open a store on a backend that already holds one.
    ///
    /// The persistence strategy recorded in the store wins over the one in
    /// `config`.
    pub fn open_with_storage(storage: Box<dyn Storage>, config: StoreConfig) -> Result<Self, StoreError> {
        let pages = PageStore::open(storage)?;
        let mut config = config;
        if pages.strategy() != config.strategy {
            warn!(
                configured = %config.strategy,
                recorded = %pages.strategy(),
                "store was created with a different persistence strategy"
            );
            config.strategy = pages.strategy();
        }

        let store = Self::from_page_store(pages, config);
        if config.preload_pages > 0 {
            let loaded = store.read()?.preload_related(config.preload_pages)?;
            info!(loaded, requested = config.preload_pages, "preloaded related resource index");
        }
        Ok(store)
    }

    fn from_page_store(pages: Arc<PageStore>, config: StoreConfig) -> Self {
        let related_cache = Arc::new(PageCache::new());
        pages.register_cache(&related_cache);
        Self {
            pages,
            config,
            graphs: RwLock::new(GraphCache::default()),
            related_cache,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn strategy(&self) -> PersistenceStrategy {
        self.pages.strategy()
    }

    /// The underlying page store, for components that keep their own trees.
    #[must_use]
    pub const fn page_store(&self) -> &Arc<PageStore> {
        &self.pages
    }

    /// Header of the latest commit.
    #[must_use]
    pub fn head(&self) -> TransactionHeader {
        self.pages.head()
    }

    /// Begin the write transaction, blocking while another one is open.
    pub fn begin_write(&self) -> Result<WriteTransaction<'_>, StoreError> {
        let pages = self.pages.begin_write();
        let graphs = self.graph_index(&pages, pages.base())?;
        WriteTransaction::begin(self, pages, &graphs)
    }

    /// Begin a read transaction on the latest commit.
    pub fn read(&self) -> Result<ReadTransaction, StoreError> {
        let snapshot = self.pages.head_reader();
        let graphs = self.graph_index(&snapshot, snapshot.header())?;
        Ok(ReadTransaction::new(snapshot, graphs, self))
    }

    /// Begin a read transaction on a historical commit.
    pub fn read_at(&self, commit: &TransactionHeader) -> Result<ReadTransaction, StoreError> {
        let snapshot = self.pages.open_reader(commit)?;
        let graphs = self.graph_index(&snapshot, snapshot.header())?;
        Ok(ReadTransaction::new(snapshot, graphs, self))
    }

    /// Every commit still available, newest first.
    pub fn commit_points(&self) -> Result<Vec<TransactionHeader>, StoreError> {
        Ok(self.pages.commit_points()?)
    }

    /// Publish the roots of an older commit as a new commit.
    ///
    /// The statistics of `commit` are carried forward in a new record, so
    /// the revert commit has a record of its own. Blocks while a write
    /// transaction is open.
    pub fn revert_to(&self, commit: &TransactionHeader) -> Result<TransactionHeader, StoreError> {
        let mut pages = self.pages.begin_revert(commit)?;
        let transaction_id = pages.base().transaction_id + 1;

        let mut log = StatisticsLog::new(commit.root(STATISTICS_ROOT));
        let record = log
            .latest_readable(&pages)?
            .map(|record| StatisticsBuilder::from_record(&record))
            .unwrap_or_default()
            .build(transaction_id);
        let mut roots = commit.roots.clone();
        roots.insert(STATISTICS_ROOT.to_string(), log.append(&mut pages, &record)?);

        Ok(pages.commit(roots)?)
    }

    /// Discard every cached page of the related resource index.
    pub fn flush_related_cache(&self) {
        self.related_cache.clear();
    }

    pub(crate) const fn related_cache(&self) -> &Arc<PageCache> {
        &self.related_cache
    }

    /// Remember the graph index of a commit that just became the head.
    pub(crate) fn publish_graphs(&self, transaction_id: TransactionId, graphs: GraphIndex) {
        self.graph_cache_mut().set(transaction_id, Arc::new(graphs));
    }

    /// The graph index as of `header`, loading it when it is not cached.
    fn graph_index<R: PageRead>(
        &self,
        pages: &R,
        header: &TransactionHeader,
    ) -> Result<Arc<GraphIndex>, StoreError> {
        if let Some(graphs) = self.graph_cache().get(header.transaction_id) {
            return Ok(graphs);
        }
        let graphs = Arc::new(GraphIndex::open(
            pages,
            header.root(GRAPH_INDEX_ROOT),
            self.config.max_keys_per_node,
        )?);
        if header.transaction_id == self.pages.head().transaction_id {
            self.graph_cache_mut()
                .set(header.transaction_id, Arc::clone(&graphs));
        }
        Ok(graphs)
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn graph_cache(&self) -> std::sync::RwLockReadGuard<'_, GraphCache> {
        self.graphs.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn graph_cache_mut(&self) -> std::sync::RwLockWriteGuard<'_, GraphCache> {
        self.graphs.write().expect("lock poisoned")
    }
}

/// Errors that can occur during store operations.
#[derive(Debug)]
pub enum StoreError {
    /// Page store error.
    Page(PageStoreError),
    /// B+Tree error.
    Tree(TreeError),
    /// Graph index error.
    Graph(GraphIndexError),
    /// Related resource index error.
    Related(RelatedIndexError),
    /// Statistics error.
    Statistics(StatisticsError),
    /// Configuration error.
    Config(ConfigError),
    /// The root name is managed by the store.
    ReservedRoot(String),
    /// The transaction was aborted by an earlier storage error.
    TransactionClosed,
}

impl StoreError {
    /// The page store error underneath, if any.
    ///
    /// These abort the write transaction they occur in.
    #[must_use]
    pub const fn page_store_error(&self) -> Option<&PageStoreError> {
        match self {
            Self::Page(e)
            | Self::Tree(TreeError::Store(e))
            | Self::Graph(GraphIndexError::Tree(TreeError::Store(e)))
            | Self::Related(RelatedIndexError::Tree(TreeError::Store(e)))
            | Self::Statistics(StatisticsError::Store(e)) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "page store error: {e}"),
            Self::Tree(e) => write!(f, "B+Tree error: {e}"),
            Self::Graph(e) => write!(f, "graph index error: {e}"),
            Self::Related(e) => write!(f, "related resource index error: {e}"),
            Self::Statistics(e) => write!(f, "statistics error: {e}"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::ReservedRoot(name) => write!(f, "root name {name:?} is reserved"),
            Self::TransactionClosed => write!(f, "transaction is closed"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Graph(e) => Some(e),
            Self::Related(e) => Some(e),
            Self::Statistics(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::ReservedRoot(_) | Self::TransactionClosed => None,
        }
    }
}

impl From<PageStoreError> for StoreError {
    fn from(e: PageStoreError) -> Self {
        Self::Page(e)
    }
}

impl From<TreeError> for StoreError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<GraphIndexError> for StoreError {
    fn from(e: GraphIndexError) -> Self {
        Self::Graph(e)
    }
}

impl From<RelatedIndexError> for StoreError {
    fn from(e: RelatedIndexError) -> Self {
        Self::Related(e)
    }
}

impl From<StatisticsError> for StoreError {
    fn from(e: StatisticsError) -> Self {
        Self::Statistics(e)
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
