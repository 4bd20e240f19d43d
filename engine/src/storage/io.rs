//! Storage backend abstraction.
//!
//! The page store talks to raw storage through the [`Storage`] trait so the
//! same commit logic runs against a real file in production and against
//! [`MemoryStorage`](crate::storage::MemoryStorage) with injected faults in
//! tests.
//!
//! Backends know nothing about checksums, headers or transactions. They move
//! whole pages and provide a durability barrier.

use crate::storage::page::{Page, PageId};

/// Errors that can occur during backend operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(
                f,
                "page {page_id} out of bounds (total pages: {total_pages})"
            ),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-based storage.
///
/// Implementations must ensure:
/// - `read_page` returns the last written content for a page
/// - `sync` makes all previous writes durable
/// - `ensure_capacity` never shrinks the storage
pub trait Storage: Send {
    /// Read a page from storage.
    ///
    /// Returns an error if the page ID is out of bounds.
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError>;

    /// Write a page to storage.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Grow the storage so that it holds at least `total_pages` pages.
    fn ensure_capacity(&mut self, total_pages: u64) -> Result<(), StorageError>;

    /// Get the total number of pages in storage.
    fn total_pages(&self) -> u64;
}
