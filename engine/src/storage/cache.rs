//! Caller-driven page cache.
//!
//! The cache has no eviction policy. Pages enter through
//! [`PageCacheControl::preload`] and leave through
//! [`PageCacheControl::flush_cache`] or when the page store recycles them.
//! Pages are immutable once written, so a cached copy can only go stale when
//! its id is reused, and the page store reports every reuse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::storage::page::{Page, PageId};
use crate::storage::page_store::{PageRead, PageStoreError};

/// Explicit control over a component's page cache.
pub trait PageCacheControl {
    /// Load up to `max_pages` pages into the cache and return how many were loaded.
    fn preload<R: PageRead>(&self, pages: &R, max_pages: usize) -> Result<usize, PageStoreError>;

    /// Discard every cached page.
    fn flush_cache(&self);
}

/// A shared map of verified pages.
#[derive(Debug, Default)]
pub struct PageCache {
    pages: Mutex<HashMap<PageId, Arc<Page>>>,
}

impl PageCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn pages(&self) -> MutexGuard<'_, HashMap<PageId, Arc<Page>>> {
        self.pages.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn get(&self, page_id: PageId) -> Option<Arc<Page>> {
        self.pages().get(&page_id).cloned()
    }

    pub fn insert(&self, page_id: PageId, page: Arc<Page>) {
        self.pages().insert(page_id, page);
    }

    /// Forget the given pages.
    pub fn evict(&self, page_ids: &[PageId]) {
        let mut pages = self.pages();
        let before = pages.len();
        for page_id in page_ids {
            pages.remove(page_id);
        }
        let evicted = before - pages.len();
        if evicted > 0 {
            debug!(evicted, "evicted recycled pages from cache");
        }
    }

    pub fn clear(&self) {
        self.pages().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages().is_empty()
    }
}

/// Reads through a cache, falling back to the wrapped reader on a miss.
///
/// Misses are not added to the cache.
pub struct CachedReader<'a, R> {
    inner: &'a R,
    cache: &'a PageCache,
}

impl<'a, R: PageRead> CachedReader<'a, R> {
    pub const fn new(inner: &'a R, cache: &'a PageCache) -> Self {
        Self { inner, cache }
    }
}

impl<R: PageRead> PageRead for CachedReader<'_, R> {
    fn read_page(&self, page_id: PageId) -> Result<Arc<Page>, PageStoreError> {
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }
        self.inner.read_page(page_id)
    }
}
