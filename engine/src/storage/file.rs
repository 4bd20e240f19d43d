//! Single-file storage backend.
//!
//! The store lives in one file of 8KB pages. Page `n` starts at byte offset
//! `n * PAGE_SIZE`. The file only ever grows.

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::storage::io::{Storage, StorageError};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageId};

/// A file handle with page-granular positional I/O.
pub struct FileStorage {
    file: File,
    path: PathBuf,
    total_pages: u64,
}

impl FileStorage {
    /// Create a new, empty store file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(FileError::Io)?;

        debug!(path = %path.display(), "created store file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages: 0,
        })
    }

    /// Open an existing store file.
    pub fn open(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let len = file.metadata().map_err(FileError::Io)?.len();
        // A crash while the file was being extended can leave a partial
        // trailing page. It was never published, so it is ignored.
        let total_pages = len / PAGE_SIZE_U64;

        debug!(path = %path.display(), total_pages, "opened store file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            total_pages,
        })
    }

    /// The path this store was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    const fn check_bounds(&self, page_id: PageId) -> Result<(), StorageError> {
        if page_id >= self.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id,
                total_pages: self.total_pages,
            });
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    #[cfg(unix)]
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        self.check_bounds(page_id)?;
        let mut page = Page::new();
        self.file
            .read_exact_at(page.as_bytes_mut(), page_id * PAGE_SIZE_U64)?;
        Ok(page)
    }

    #[cfg(not(unix))]
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StorageError> {
        self.check_bounds(page_id)?;
        let mut page = Page::new();
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        self.file.read_exact(page.as_bytes_mut())?;
        Ok(page)
    }

    #[cfg(unix)]
    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.check_bounds(page_id)?;
        self.file
            .write_all_at(page.as_bytes(), page_id * PAGE_SIZE_U64)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StorageError> {
        self.check_bounds(page_id)?;
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        self.file.write_all(page.as_bytes())?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn ensure_capacity(&mut self, total_pages: u64) -> Result<(), StorageError> {
        if total_pages <= self.total_pages {
            return Ok(());
        }
        self.file.set_len(total_pages * PAGE_SIZE_U64)?;
        self.total_pages = total_pages;
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.total_pages
    }
}

/// Errors that can occur while creating or opening a store file.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyExists(_) => None,
        }
    }
}
