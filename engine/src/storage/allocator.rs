//! Page allocator for copy-on-write transactions.
//!
//! New pages come from the free list when there is one, otherwise from the
//! end of the store. What happens to superseded pages depends on the
//! persistence strategy:
//!
//! - Append-only: nothing. Superseded pages stay valid forever.
//! - Rewrite: a page superseded by commit `T` is still reachable from every
//!   snapshot older than `T`. It waits in the retired queue until the oldest
//!   registered reader is at `T` or newer and then moves to the free list.
//!
//! The free list lives in memory only. Pages that were free when a rewrite
//! store was closed stay unused after reopening until a consolidation pass
//! reclaims them.

use std::collections::{BTreeSet, VecDeque};

use crate::config::PersistenceStrategy;
use crate::storage::header::TransactionId;
use crate::storage::page::PageId;

/// Pages superseded by one commit.
#[derive(Debug)]
struct RetiredBatch {
    superseded_by: TransactionId,
    pages: Vec<PageId>,
}

/// Result of a reclamation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Pages that moved to the free list.
    pub pages: Vec<PageId>,
    /// Snapshots older than this transaction may reference recycled pages.
    pub horizon: Option<TransactionId>,
}

/// Hands out page ids and tracks superseded pages.
#[derive(Debug)]
pub struct PageAllocator {
    strategy: PersistenceStrategy,
    /// First page id never handed out.
    next_page_id: PageId,
    /// Pages that may be reused right away.
    free: BTreeSet<PageId>,
    /// Superseded pages waiting for readers to move on, oldest first.
    retired: VecDeque<RetiredBatch>,
}

impl PageAllocator {
    /// Create an allocator that hands out ids from `next_page_id` upwards.
    #[must_use]
    pub const fn new(strategy: PersistenceStrategy, next_page_id: PageId) -> Self {
        Self {
            strategy,
            next_page_id,
            free: BTreeSet::new(),
            retired: VecDeque::new(),
        }
    }

    /// Allocate a single page.
    ///
    /// Returns the page id and whether it extends the store.
    pub fn allocate(&mut self) -> (PageId, bool) {
        if let Some(page_id) = self.free.pop_first() {
            return (page_id, false);
        }
        let page_id = self.next_page_id;
        self.next_page_id += 1;
        (page_id, true)
    }

    /// Return pages that no snapshot can reach (for example, pages allocated
    /// by an aborted transaction).
    ///
    /// Returns the pages that actually became reusable.
    pub fn release(&mut self, pages: impl IntoIterator<Item = PageId>) -> Vec<PageId> {
        if self.strategy == PersistenceStrategy::AppendOnly {
            return Vec::new();
        }
        let released: Vec<PageId> = pages.into_iter().collect();
        self.free.extend(released.iter().copied());
        released
    }

    /// Record pages superseded by commit `superseded_by`.
    pub fn retire(&mut self, superseded_by: TransactionId, pages: Vec<PageId>) {
        if self.strategy == PersistenceStrategy::AppendOnly || pages.is_empty() {
            return;
        }
        self.retired.push_back(RetiredBatch {
            superseded_by,
            pages,
        });
    }

    /// Move every retired batch that no reader can reach to the free list.
    ///
    /// `oldest_reader` is the oldest registered snapshot, or `None` when no
    /// reader is registered.
    pub fn reclaim(&mut self, oldest_reader: Option<TransactionId>) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        while let Some(batch) = self.retired.front() {
            if oldest_reader.is_some_and(|oldest| oldest < batch.superseded_by) {
                break;
            }
            let Some(batch) = self.retired.pop_front() else {
                break;
            };
            reclaimed.horizon = Some(batch.superseded_by);
            self.free.extend(batch.pages.iter().copied());
            reclaimed.pages.extend(batch.pages);
        }
        reclaimed
    }

    /// First page id never handed out.
    #[must_use]
    pub const fn next_page_id(&self) -> PageId {
        self.next_page_id
    }

    /// Number of pages ready for reuse.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Number of superseded pages still waiting for readers.
    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.retired.iter().map(|batch| batch.pages.len()).sum()
    }
}
