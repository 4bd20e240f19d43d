//! Copy-on-write page store.
//!
//! The page store is the only component that touches raw page bytes. Every
//! other component holds page ids and goes through one of the capability
//! traits:
//!
//! - [`PageRead`]: read a verified page
//! - [`PageWrite`]: allocate, write and retire pages inside a transaction
//!
//! # Commit protocol
//!
//! A [`PageTransaction`] writes only pages it allocated itself, each exactly
//! once. On commit it
//!
//! 1. writes the commit record (append-only stores),
//! 2. syncs every written page,
//! 3. writes the new transaction header into the alternate header slot,
//! 4. syncs again,
//!
//! and only then makes the new head visible. A failure anywhere leaves the
//! previous head in place, on disk and in memory.
//!
//! # Readers
//!
//! A [`Snapshot`] is pinned to one commit. It is registered for its whole
//! lifetime so the rewrite strategy never recycles a page it can reach.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::{debug, info, warn};

use crate::config::PersistenceStrategy;
use crate::storage::allocator::PageAllocator;
use crate::storage::cache::PageCache;
use crate::storage::file::FileError;
use crate::storage::header::{
    HEADER_SLOTS, HeaderError, NamedRoots, TransactionHeader, TransactionId, now_millis,
};
use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{Page, PageId, PageType};

/// Read access to pages.
pub trait PageRead {
    /// Read a page and verify its checksum.
    fn read_page(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError>;
}

/// Write access to pages. Only available inside a write transaction.
pub trait PageWrite {
    /// Reserve a fresh page for the current transaction.
    fn allocate_page(&mut self) -> Result<PageId, PageStoreError>;

    /// Seal and write a page allocated by the current transaction.
    ///
    /// Each allocated page may be written once.
    fn write_page(&mut self, page_id: PageId, page: Page) -> Result<(), PageStoreError>;

    /// Report a page that is no longer reachable from the new roots.
    fn retire_page(&mut self, page_id: PageId);
}

impl<T: PageRead + ?Sized> PageRead for &T {
    fn read_page(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError> {
        (**self).read_page(page_id)
    }
}

/// Registered snapshots.
#[derive(Debug, Default)]
struct ReaderRegistry {
    /// Snapshot transaction id to number of open readers.
    active: BTreeMap<TransactionId, usize>,
    /// Snapshots older than this may reference recycled pages.
    horizon: TransactionId,
}

impl ReaderRegistry {
    fn oldest(&self) -> Option<TransactionId> {
        self.active.keys().next().copied()
    }
}

/// The page store.
///
/// Shared between the store facade and every open snapshot through an `Arc`.
pub struct PageStore {
    storage: Mutex<Box<dyn Storage>>,
    strategy: PersistenceStrategy,
    head: RwLock<TransactionHeader>,
    /// Holding this lock is what makes a transaction the single writer.
    writer: Mutex<PageAllocator>,
    readers: Mutex<ReaderRegistry>,
    caches: Mutex<Vec<Weak<PageCache>>>,
}

impl PageStore {
    /// Initialize a new store on empty storage.
    pub fn create(
        mut storage: Box<dyn Storage>,
        strategy: PersistenceStrategy,
    ) -> Result<Arc<Self>, PageStoreError> {
        let mut header = TransactionHeader::empty(strategy);
        let mut allocator = PageAllocator::new(strategy, header.next_page_id);

        if strategy == PersistenceStrategy::AppendOnly {
            let (record_page, _) = allocator.allocate();
            header.commit_page = record_page;
        }
        header.next_page_id = allocator.next_page_id();

        storage
            .ensure_capacity(header.next_page_id)
            .map_err(|source| PageStoreError::Io {
                page_id: None,
                source,
            })?;

        if header.commit_page != 0 {
            let record = header.to_page(PageType::CommitRecord)?;
            write_raw(storage.as_mut(), header.commit_page, &record)?;
        }
        let page = header.to_page(PageType::TransactionHeader)?;
        write_raw(storage.as_mut(), header.slot(), &page)?;
        sync_raw(storage.as_mut())?;

        info!(%strategy, "created page store");

        Ok(Arc::new(Self {
            storage: Mutex::new(storage),
            strategy,
            head: RwLock::new(header),
            writer: Mutex::new(allocator),
            readers: Mutex::new(ReaderRegistry::default()),
            caches: Mutex::new(Vec::new()),
        }))
    }

    /// Open a store, selecting the newest valid transaction header.
    pub fn open(mut storage: Box<dyn Storage>) -> Result<Arc<Self>, PageStoreError> {
        let read_slot = |storage: &mut dyn Storage, slot: PageId| {
            storage
                .read_page(slot)
                .map_err(|e| HeaderError::Unreadable(e.to_string()))
                .and_then(|page| TransactionHeader::from_page(&page, PageType::TransactionHeader))
        };
        let slot0 = read_slot(storage.as_mut(), HEADER_SLOTS[0]);
        let slot1 = read_slot(storage.as_mut(), HEADER_SLOTS[1]);

        let damaged_slot = match (&slot0, &slot1) {
            (Err(e), Ok(_)) => Some((HEADER_SLOTS[0], e.to_string())),
            (Ok(_), Err(e)) => Some((HEADER_SLOTS[1], e.to_string())),
            _ => None,
        };
        let head = TransactionHeader::select_head(slot0, slot1)?;

        // The second slot of a brand-new store has never been written.
        if let Some((slot, reason)) = damaged_slot.filter(|_| head.transaction_id > 0) {
            warn!(
                slot,
                reason,
                transaction_id = head.transaction_id,
                "ignoring invalid header slot"
            );
        }

        info!(
            transaction_id = head.transaction_id,
            strategy = %head.strategy,
            next_page_id = head.next_page_id,
            "opened page store"
        );

        let strategy = head.strategy;
        let allocator = PageAllocator::new(strategy, head.next_page_id);
        Ok(Arc::new(Self {
            storage: Mutex::new(storage),
            strategy,
            head: RwLock::new(head),
            writer: Mutex::new(allocator),
            readers: Mutex::new(ReaderRegistry::default()),
            caches: Mutex::new(Vec::new()),
        }))
    }

    /// Persistence strategy recorded when the store was created.
    #[must_use]
    pub const fn strategy(&self) -> PersistenceStrategy {
        self.strategy
    }

    /// The current head.
    #[must_use]
    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    pub fn head(&self) -> TransactionHeader {
        self.head.read().expect("lock poisoned").clone()
    }

    /// Begin the single write transaction, blocking while another is open.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn begin_write(&self) -> PageTransaction<'_> {
        let mut allocator = self.writer.lock().expect("lock poisoned");
        self.reclaim(&mut allocator);
        let base = self.head();
        debug!(base = base.transaction_id, "began page transaction");
        PageTransaction {
            store: self,
            allocator,
            base,
            allocated: HashSet::new(),
            written: HashSet::new(),
            retired: Vec::new(),
            scratch: Vec::new(),
            finished: false,
        }
    }

    /// Open a reader pinned to the current head.
    #[must_use]
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn head_reader(self: &Arc<Self>) -> Snapshot {
        // Reading the head under the registry lock orders this registration
        // before any reclamation that could touch the head's pages.
        let mut readers = self.readers.lock().expect("lock poisoned");
        let header = self.head();
        *readers.active.entry(header.transaction_id).or_default() += 1;
        drop(readers);

        Snapshot {
            store: Arc::clone(self),
            header,
        }
    }

    /// Open a reader pinned to a historical commit.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn open_reader(
        self: &Arc<Self>,
        header: &TransactionHeader,
    ) -> Result<Snapshot, PageStoreError> {
        let mut readers = self.readers.lock().expect("lock poisoned");
        let head_id = self.head().transaction_id;
        if header.transaction_id > head_id {
            return Err(PageStoreError::UnknownCommit {
                transaction_id: header.transaction_id,
            });
        }
        if header.transaction_id < readers.horizon {
            return Err(PageStoreError::SnapshotExpired {
                transaction_id: header.transaction_id,
                horizon: readers.horizon,
            });
        }
        *readers.active.entry(header.transaction_id).or_default() += 1;
        drop(readers);

        Ok(Snapshot {
            store: Arc::clone(self),
            header: header.clone(),
        })
    }

    /// Every retained commit, newest first.
    ///
    /// Only append-only stores keep history; a rewrite store returns just
    /// its head.
    pub fn commit_points(&self) -> Result<Vec<TransactionHeader>, PageStoreError> {
        let head = self.head();
        if head.commit_page == 0 {
            return Ok(vec![head]);
        }

        let mut points = Vec::new();
        let mut next = head.commit_page;
        while next != 0 {
            let page = self.read_verified(next)?;
            let record = TransactionHeader::from_page(&page, PageType::CommitRecord).map_err(
                |e| PageStoreError::Corruption {
                    page_id: next,
                    reason: e.to_string(),
                },
            )?;
            next = record.previous_commit_page;
            points.push(record);
        }
        Ok(points)
    }

    /// Publish the roots of an older commit as a new commit.
    pub fn revert_to(
        &self,
        target: &TransactionHeader,
    ) -> Result<TransactionHeader, PageStoreError> {
        self.begin_revert(target)?.commit(target.roots.clone())
    }

    /// Begin the write transaction that will republish `target`.
    ///
    /// Only append-only stores keep the pages of older commits.
    pub fn begin_revert(
        &self,
        target: &TransactionHeader,
    ) -> Result<PageTransaction<'_>, PageStoreError> {
        if self.strategy != PersistenceStrategy::AppendOnly {
            return Err(PageStoreError::HistoryUnavailable);
        }
        let txn = self.begin_write();
        if target.transaction_id > txn.base().transaction_id {
            return Err(PageStoreError::UnknownCommit {
                transaction_id: target.transaction_id,
            });
        }
        info!(target = target.transaction_id, "reverting to commit");
        Ok(txn)
    }

    /// Register a cache that must forget pages when they are recycled.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn register_cache(&self, cache: &Arc<PageCache>) {
        let mut caches = self.caches.lock().expect("lock poisoned");
        caches.retain(|weak| weak.strong_count() > 0);
        caches.push(Arc::downgrade(cache));
    }

    /// Number of pages the backend currently holds.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    pub fn total_pages(&self) -> u64 {
        self.storage.lock().expect("lock poisoned").total_pages()
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn read_verified(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError> {
        let page = {
            let mut storage = self.storage.lock().expect("lock poisoned");
            storage.read_page(page_id)
        };
        let page = page.map_err(|source| match source {
            StorageError::PageOutOfBounds { total_pages, .. } => PageStoreError::Corruption {
                page_id,
                reason: format!("missing page (store holds {total_pages} pages)"),
            },
            source => PageStoreError::Io {
                page_id: Some(page_id),
                source,
            },
        })?;

        page.verify().map_err(|e| PageStoreError::Corruption {
            page_id,
            reason: e.to_string(),
        })?;
        Ok(Arc::new(page))
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn release_reader(&self, transaction_id: TransactionId) {
        let mut readers = self.readers.lock().expect("lock poisoned");
        if let Some(count) = readers.active.get_mut(&transaction_id) {
            *count -= 1;
            if *count == 0 {
                readers.active.remove(&transaction_id);
            }
        }
    }

    /// Move retired pages that no reader can reach to the free list.
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn reclaim(&self, allocator: &mut PageAllocator) {
        if self.strategy != PersistenceStrategy::Rewrite {
            return;
        }
        let mut readers = self.readers.lock().expect("lock poisoned");
        let reclaimed = allocator.reclaim(readers.oldest());
        if let Some(horizon) = reclaimed.horizon {
            readers.horizon = readers.horizon.max(horizon);
        }
        drop(readers);

        if !reclaimed.pages.is_empty() {
            debug!(
                pages = reclaimed.pages.len(),
                horizon = ?reclaimed.horizon,
                "reclaimed superseded pages"
            );
            self.invalidate_cached(&reclaimed.pages);
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn invalidate_cached(&self, pages: &[PageId]) {
        if pages.is_empty() {
            return;
        }
        let caches = self.caches.lock().expect("lock poisoned");
        for cache in caches.iter().filter_map(Weak::upgrade) {
            cache.evict(pages);
        }
    }
}

fn write_raw(storage: &mut dyn Storage, page_id: PageId, page: &Page) -> Result<(), PageStoreError> {
    storage
        .write_page(page_id, page)
        .map_err(|source| PageStoreError::Io {
            page_id: Some(page_id),
            source,
        })
}

fn sync_raw(storage: &mut dyn Storage) -> Result<(), PageStoreError> {
    storage.sync().map_err(|source| PageStoreError::Io {
        page_id: None,
        source,
    })
}

/// The single in-flight write transaction.
///
/// Dropping it without committing aborts it.
pub struct PageTransaction<'s> {
    store: &'s PageStore,
    allocator: MutexGuard<'s, PageAllocator>,
    base: TransactionHeader,
    allocated: HashSet<PageId>,
    written: HashSet<PageId>,
    /// Published pages superseded by this transaction.
    retired: Vec<PageId>,
    /// Pages this transaction allocated and then superseded itself.
    scratch: Vec<PageId>,
    finished: bool,
}

impl PageTransaction<'_> {
    /// The commit this transaction started from.
    #[must_use]
    pub const fn base(&self) -> &TransactionHeader {
        &self.base
    }

    /// Number of pages written so far.
    #[must_use]
    pub fn pages_written(&self) -> usize {
        self.written.len()
    }

    /// Durably publish `roots` as the new head.
    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    pub fn commit(mut self, roots: NamedRoots) -> Result<TransactionHeader, PageStoreError> {
        let transaction_id = self.base.transaction_id + 1;
        let mut header = TransactionHeader {
            transaction_id,
            timestamp_millis: now_millis(),
            strategy: self.store.strategy,
            next_page_id: 0,
            commit_page: 0,
            previous_commit_page: self.base.commit_page,
            roots,
        };

        if self.store.strategy == PersistenceStrategy::AppendOnly {
            header.commit_page = self.allocate_page()?;
            header.next_page_id = self.allocator.next_page_id();
            let record = header.to_page(PageType::CommitRecord)?;
            self.write_page(header.commit_page, record)?;
        } else {
            header.next_page_id = self.allocator.next_page_id();
        }

        let header_page = header.to_page(PageType::TransactionHeader)?;
        {
            let mut storage = self.store.storage.lock().expect("lock poisoned");
            sync_raw(storage.as_mut())?;

            // Past this point the header may reach the disk even if a call
            // fails, so the pages it references are never handed out again.
            self.finished = true;
            let published = write_raw(storage.as_mut(), header.slot(), &header_page)
                .and_then(|()| sync_raw(storage.as_mut()));
            if let Err(e) = published {
                warn!(
                    transaction_id,
                    pages = self.allocated.len(),
                    error = %e,
                    "header write failed; commit outcome unknown until reopen"
                );
                return Err(e);
            }
        }

        *self.store.head.write().expect("lock poisoned") = header.clone();

        let retired = std::mem::take(&mut self.retired);
        let retired_count = retired.len();
        self.allocator.retire(transaction_id, retired);
        let scratch = std::mem::take(&mut self.scratch);
        let released = self.allocator.release(scratch);
        self.store.invalidate_cached(&released);
        self.store.reclaim(&mut self.allocator);

        info!(
            transaction_id,
            pages_written = self.written.len(),
            pages_retired = retired_count,
            "committed transaction"
        );
        Ok(header)
    }

    /// Discard the transaction. Equivalent to dropping it.
    pub fn abort(self) {}

    fn release_uncommitted(&mut self) {
        let pages: Vec<PageId> = self.allocated.drain().collect();
        let count = pages.len();
        let released = self.allocator.release(pages);
        self.store.invalidate_cached(&released);
        debug!(
            base = self.base.transaction_id,
            pages_allocated = count,
            pages_released = released.len(),
            "aborted page transaction"
        );
    }
}

impl Drop for PageTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.release_uncommitted();
        }
    }
}

impl PageRead for PageTransaction<'_> {
    fn read_page(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError> {
        self.store.read_verified(page_id)
    }
}

impl PageWrite for PageTransaction<'_> {
    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn allocate_page(&mut self) -> Result<PageId, PageStoreError> {
        let (page_id, extends) = self.allocator.allocate();
        if extends {
            let mut storage = self.store.storage.lock().expect("lock poisoned");
            storage
                .ensure_capacity(page_id + 1)
                .map_err(|source| PageStoreError::Io {
                    page_id: Some(page_id),
                    source,
                })?;
        }
        self.allocated.insert(page_id);
        Ok(page_id)
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn write_page(&mut self, page_id: PageId, mut page: Page) -> Result<(), PageStoreError> {
        if !self.allocated.contains(&page_id) || !self.written.insert(page_id) {
            return Err(PageStoreError::PageNotWritable { page_id });
        }
        page.seal();
        let mut storage = self.store.storage.lock().expect("lock poisoned");
        write_raw(storage.as_mut(), page_id, &page)
    }

    fn retire_page(&mut self, page_id: PageId) {
        if self.allocated.contains(&page_id) {
            self.scratch.push(page_id);
        } else {
            self.retired.push(page_id);
        }
    }
}

/// A reader pinned to one commit.
pub struct Snapshot {
    store: Arc<PageStore>,
    header: TransactionHeader,
}

impl Snapshot {
    /// The commit this reader observes.
    #[must_use]
    pub const fn header(&self) -> &TransactionHeader {
        &self.header
    }

    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        self.header.transaction_id
    }

    /// Root published under `name` in this snapshot.
    #[must_use]
    pub fn root(&self, name: &str) -> PageId {
        self.header.root(name)
    }

    /// The store this reader belongs to.
    #[must_use]
    pub const fn store(&self) -> &Arc<PageStore> {
        &self.store
    }
}

impl PageRead for Snapshot {
    fn read_page(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError> {
        self.store.read_verified(page_id)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.store.release_reader(self.header.transaction_id);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("transaction_id", &self.header.transaction_id)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur during page store operations.
#[derive(Debug)]
pub enum PageStoreError {
    /// A page is missing, has the wrong type or fails its checksum.
    Corruption { page_id: PageId, reason: String },
    /// The backend failed.
    Io {
        page_id: Option<PageId>,
        source: StorageError,
    },
    /// The page was not allocated by this transaction or was already written.
    PageNotWritable { page_id: PageId },
    /// Pages reachable from this snapshot may already have been recycled.
    SnapshotExpired {
        transaction_id: TransactionId,
        horizon: TransactionId,
    },
    /// The commit is newer than the current head.
    UnknownCommit { transaction_id: TransactionId },
    /// The store does not keep commit history.
    HistoryUnavailable,
    /// Transaction header error.
    Header(HeaderError),
    /// The store file already exists.
    AlreadyExists(PathBuf),
}

impl std::fmt::Display for PageStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Corruption { page_id, reason } => {
                write!(f, "storage corruption on page {page_id}: {reason}")
            }
            Self::Io {
                page_id: Some(page_id),
                source,
            } => write!(f, "I/O error on page {page_id}: {source}"),
            Self::Io {
                page_id: None,
                source,
            } => write!(f, "I/O error: {source}"),
            Self::PageNotWritable { page_id } => {
                write!(f, "page {page_id} is not writable in this transaction")
            }
            Self::SnapshotExpired {
                transaction_id,
                horizon,
            } => write!(
                f,
                "snapshot {transaction_id} expired (oldest readable commit is {horizon})"
            ),
            Self::UnknownCommit { transaction_id } => {
                write!(f, "commit {transaction_id} does not exist")
            }
            Self::HistoryUnavailable => write!(f, "store does not keep commit history"),
            Self::Header(e) => write!(f, "header error: {e}"),
            Self::AlreadyExists(p) => write!(f, "store already exists: {}", p.display()),
        }
    }
}

impl std::error::Error for PageStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Header(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HeaderError> for PageStoreError {
    fn from(e: HeaderError) -> Self {
        Self::Header(e)
    }
}

impl From<FileError> for PageStoreError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::AlreadyExists(path) => Self::AlreadyExists(path),
            FileError::Io(e) => Self::Io {
                page_id: None,
                source: StorageError::Io(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FaultConfig, MemoryStorage};

    fn data_page(marker: u64) -> Page {
        let mut page = Page::with_type(PageType::Overflow);
        page.write_u64(64, marker);
        page
    }

    fn write_marker(txn: &mut PageTransaction<'_>, marker: u64) -> PageId {
        let page_id = txn.allocate_page().expect("allocate");
        txn.write_page(page_id, data_page(marker)).expect("write");
        page_id
    }

    fn roots(pairs: &[(&str, PageId)]) -> NamedRoots {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    fn new_store(strategy: PersistenceStrategy) -> (Arc<PageStore>, MemoryStorage) {
        let disk = MemoryStorage::new(7);
        let store = PageStore::create(Box::new(disk.clone()), strategy).expect("create");
        (store, disk)
    }

    #[test]
    fn test_create_and_reopen_empty() {
        let (store, disk) = new_store(PersistenceStrategy::AppendOnly);
        assert_eq!(store.head().transaction_id, 0);
        drop(store);

        let store = PageStore::open(Box::new(disk)).expect("open");
        let head = store.head();
        assert_eq!(head.transaction_id, 0);
        assert_eq!(head.strategy, PersistenceStrategy::AppendOnly);
        assert!(head.roots.is_empty());
    }

    #[test]
    fn test_commit_publishes_roots() {
        let (store, disk) = new_store(PersistenceStrategy::AppendOnly);

        let mut txn = store.begin_write();
        let page_id = write_marker(&mut txn, 99);
        let header = txn.commit(roots(&[("a", page_id)])).expect("commit");
        assert_eq!(header.transaction_id, 1);
        assert_eq!(store.head().root("a"), page_id);

        drop(store);
        let store = PageStore::open(Box::new(disk)).expect("open");
        let reader = store.head_reader();
        assert_eq!(reader.root("a"), page_id);
        let page = reader.read_page(page_id).expect("read");
        assert_eq!(page.read_u64(64), 99);
    }

    #[test]
    fn test_write_requires_allocation() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        let mut txn = store.begin_write();
        let result = txn.write_page(1, data_page(1));
        assert!(matches!(
            result,
            Err(PageStoreError::PageNotWritable { page_id: 1 })
        ));
    }

    #[test]
    fn test_page_written_once() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        let mut txn = store.begin_write();
        let page_id = write_marker(&mut txn, 1);
        let result = txn.write_page(page_id, data_page(2));
        assert!(matches!(result, Err(PageStoreError::PageNotWritable { .. })));
    }

    #[test]
    fn test_abort_leaves_head_unchanged() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        {
            let mut txn = store.begin_write();
            write_marker(&mut txn, 1);
            txn.abort();
        }
        assert_eq!(store.head().transaction_id, 0);
    }

    #[test]
    fn test_failed_sync_publishes_nothing() {
        let (store, disk) = new_store(PersistenceStrategy::AppendOnly);

        let mut txn = store.begin_write();
        let page_id = write_marker(&mut txn, 1);
        disk.set_fault_config(FaultConfig::failing_sync());
        let result = txn.commit(roots(&[("a", page_id)]));
        assert!(matches!(result, Err(PageStoreError::Io { .. })));
        assert_eq!(store.head().transaction_id, 0);

        // The store stays usable once the backend recovers.
        disk.set_fault_config(FaultConfig::no_faults());
        let mut txn = store.begin_write();
        let page_id = write_marker(&mut txn, 2);
        let header = txn.commit(roots(&[("a", page_id)])).expect("commit");
        assert_eq!(header.transaction_id, 1);
    }

    #[test]
    fn test_corruption_reports_page_id() {
        let (store, disk) = new_store(PersistenceStrategy::AppendOnly);
        let mut txn = store.begin_write();
        let page_id = write_marker(&mut txn, 5);
        txn.commit(roots(&[("a", page_id)])).expect("commit");

        disk.flip_byte(page_id, 1000);
        let reader = store.head_reader();
        match reader.read_page(page_id) {
            Err(PageStoreError::Corruption { page_id: bad, .. }) => assert_eq!(bad, page_id),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_page_is_corruption() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        let reader = store.head_reader();
        assert!(matches!(
            reader.read_page(10_000),
            Err(PageStoreError::Corruption {
                page_id: 10_000,
                ..
            })
        ));
    }

    #[test]
    fn test_commit_points_and_revert() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        let mut ids = Vec::new();
        for marker in 1..=3 {
            let mut txn = store.begin_write();
            let page_id = write_marker(&mut txn, marker);
            ids.push(page_id);
            txn.commit(roots(&[("a", page_id)])).expect("commit");
        }

        let points = store.commit_points().expect("history");
        let txn_ids: Vec<_> = points.iter().map(|p| p.transaction_id).collect();
        assert_eq!(txn_ids, vec![3, 2, 1, 0]);

        let reverted = store.revert_to(&points[2]).expect("revert");
        assert_eq!(reverted.transaction_id, 4);
        assert_eq!(store.head().root("a"), ids[0]);
        assert_eq!(store.commit_points().expect("history").len(), 5);
    }

    #[test]
    fn test_rewrite_has_no_history() {
        let (store, _disk) = new_store(PersistenceStrategy::Rewrite);
        let head = store.head();
        assert_eq!(store.commit_points().expect("history"), vec![head.clone()]);
        assert!(matches!(
            store.revert_to(&head),
            Err(PageStoreError::HistoryUnavailable)
        ));
    }

    #[test]
    fn test_rewrite_reuses_only_after_reader_release() {
        let (store, _disk) = new_store(PersistenceStrategy::Rewrite);

        let mut txn = store.begin_write();
        let first = write_marker(&mut txn, 1);
        let v1 = txn.commit(roots(&[("a", first)])).expect("commit");

        let old_reader = store.open_reader(&v1).expect("reader");

        let mut txn = store.begin_write();
        let second = write_marker(&mut txn, 2);
        txn.retire_page(first);
        txn.commit(roots(&[("a", second)])).expect("commit");

        // The old reader pins `first`.
        let mut txn = store.begin_write();
        let third = txn.allocate_page().expect("allocate");
        assert_ne!(third, first);
        drop(txn);

        assert_eq!(old_reader.read_page(first).expect("read").read_u64(64), 1);
        drop(old_reader);

        let mut txn = store.begin_write();
        let reused = txn.allocate_page().expect("allocate");
        assert!(reused == first || reused == third);
        drop(txn);

        assert!(matches!(
            store.open_reader(&v1),
            Err(PageStoreError::SnapshotExpired { .. })
        ));
    }

    #[test]
    fn test_rewrite_abort_returns_pages() {
        let (store, _disk) = new_store(PersistenceStrategy::Rewrite);
        let page_id = {
            let mut txn = store.begin_write();
            txn.allocate_page().expect("allocate")
        };
        let mut txn = store.begin_write();
        assert_eq!(txn.allocate_page().expect("allocate"), page_id);
    }

    #[test]
    fn test_open_reader_rejects_future_commit() {
        let (store, _disk) = new_store(PersistenceStrategy::AppendOnly);
        let mut future = store.head();
        future.transaction_id = 9;
        assert!(matches!(
            store.open_reader(&future),
            Err(PageStoreError::UnknownCommit { transaction_id: 9 })
        ));
    }
}
