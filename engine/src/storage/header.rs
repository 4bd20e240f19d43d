//! Transaction headers.
//!
//! The head of the store is a transaction header stored in one of two slots
//! (pages 0 and 1). Commit `n` writes its header into slot `n % 2`, so the
//! previous head is never overwritten by the commit that replaces it. On open
//! the valid header with the highest transaction id wins.
//!
//! The same encoding is reused for commit-record pages, which keep the commit
//! history of append-only stores.

// PAGE_SIZE and name lengths are bounded well below u32/u16/u8 limits.
#![allow(clippy::cast_possible_truncation)]

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::PersistenceStrategy;
use crate::storage::page::{PAGE_SIZE, Page, PageError, PageId, PageType};

/// Monotonic commit counter. Transaction 0 is the empty store.
pub type TransactionId = u64;

/// Named root pointers published atomically by a commit.
pub type NamedRoots = BTreeMap<String, PageId>;

/// Magic number identifying a store file: "RDFQUADS"
pub const MAGIC: [u8; 8] = *b"RDFQUADS";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// The two header slots.
pub const HEADER_SLOTS: [PageId; 2] = [0, 1];

/// First page id available for data.
pub const FIRST_DATA_PAGE: PageId = 2;

const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Header field offsets (after the common page header).
mod offsets {
    pub const MAGIC: usize = 8;
    pub const FORMAT_VERSION: usize = 16;
    pub const PAGE_SIZE: usize = 20;
    pub const STRATEGY: usize = 24;
    pub const TRANSACTION_ID: usize = 32;
    pub const TIMESTAMP: usize = 40;
    pub const NEXT_PAGE_ID: usize = 48;
    pub const COMMIT_PAGE: usize = 56;
    pub const PREVIOUS_COMMIT_PAGE: usize = 64;
    pub const ROOT_COUNT: usize = 72;
    // Each root: name length (u8), name bytes, page id (u64).
    pub const ROOTS: usize = 74;
}

/// A published (or about to be published) commit point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHeader {
    pub transaction_id: TransactionId,
    /// Wall-clock time of the commit, in milliseconds since the Unix epoch.
    pub timestamp_millis: u64,
    /// Fixed when the store is created.
    pub strategy: PersistenceStrategy,
    /// First page id never handed out by any commit up to this one.
    pub next_page_id: PageId,
    /// Commit-record page of this commit (0 when the store keeps no history).
    pub commit_page: PageId,
    /// Commit-record page of the previous commit (0 for none).
    pub previous_commit_page: PageId,
    pub roots: NamedRoots,
}

impl TransactionHeader {
    /// Header of a freshly created, empty store.
    #[must_use]
    pub fn empty(strategy: PersistenceStrategy) -> Self {
        Self {
            transaction_id: 0,
            timestamp_millis: now_millis(),
            strategy,
            next_page_id: FIRST_DATA_PAGE,
            commit_page: 0,
            previous_commit_page: 0,
            roots: NamedRoots::new(),
        }
    }

    /// Root page published under `name`, or 0 (the empty tree) if none.
    #[must_use]
    pub fn root(&self, name: &str) -> PageId {
        self.roots.get(name).copied().unwrap_or(0)
    }

    /// Header slot this commit is written to.
    #[must_use]
    pub const fn slot(&self) -> PageId {
        HEADER_SLOTS[(self.transaction_id % 2) as usize]
    }

    /// Serialize into a sealed page of the given type.
    pub fn to_page(&self, page_type: PageType) -> Result<Page, HeaderError> {
        let mut page = Page::with_type(page_type);

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, FORMAT_VERSION);
        page.write_u32(offsets::PAGE_SIZE, PAGE_SIZE_U32);
        page.write_u8(offsets::STRATEGY, self.strategy as u8);
        page.write_u64(offsets::TRANSACTION_ID, self.transaction_id);
        page.write_u64(offsets::TIMESTAMP, self.timestamp_millis);
        page.write_u64(offsets::NEXT_PAGE_ID, self.next_page_id);
        page.write_u64(offsets::COMMIT_PAGE, self.commit_page);
        page.write_u64(offsets::PREVIOUS_COMMIT_PAGE, self.previous_commit_page);

        let count = u16::try_from(self.roots.len()).map_err(|_| HeaderError::RootsTooLarge)?;
        page.write_u16(offsets::ROOT_COUNT, count);

        let mut pos = offsets::ROOTS;
        for (name, page_id) in &self.roots {
            let name_len = u8::try_from(name.len())
                .map_err(|_| HeaderError::RootNameTooLong(name.clone()))?;
            if pos + 1 + name.len() + 8 > PAGE_SIZE {
                return Err(HeaderError::RootsTooLarge);
            }
            page.write_u8(pos, name_len);
            page.write_bytes(pos + 1, name.as_bytes());
            page.write_u64(pos + 1 + name.len(), *page_id);
            pos += 1 + name.len() + 8;
        }

        page.seal();
        Ok(page)
    }

    /// Deserialize and validate a header page of the expected type.
    pub fn from_page(page: &Page, expected: PageType) -> Result<Self, HeaderError> {
        let header = page.verify().map_err(HeaderError::Page)?;
        if header.page_type != expected {
            return Err(HeaderError::WrongPageType(header.page_type));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(HeaderError::InvalidMagic(magic));
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(HeaderError::InvalidPageSize(page_size));
        }

        let strategy = PersistenceStrategy::try_from(page.read_u8(offsets::STRATEGY))
            .map_err(HeaderError::InvalidStrategy)?;

        let count = page.read_u16(offsets::ROOT_COUNT);
        let mut roots = NamedRoots::new();
        let mut pos = offsets::ROOTS;
        for _ in 0..count {
            if pos >= PAGE_SIZE {
                return Err(HeaderError::Truncated);
            }
            let name_len = usize::from(page.read_u8(pos));
            if pos + 1 + name_len + 8 > PAGE_SIZE {
                return Err(HeaderError::Truncated);
            }
            let name = std::str::from_utf8(page.read_bytes(pos + 1, name_len))
                .map_err(|_| HeaderError::Truncated)?
                .to_string();
            let page_id = page.read_u64(pos + 1 + name_len);
            roots.insert(name, page_id);
            pos += 1 + name_len + 8;
        }

        Ok(Self {
            transaction_id: page.read_u64(offsets::TRANSACTION_ID),
            timestamp_millis: page.read_u64(offsets::TIMESTAMP),
            strategy,
            next_page_id: page.read_u64(offsets::NEXT_PAGE_ID),
            commit_page: page.read_u64(offsets::COMMIT_PAGE),
            previous_commit_page: page.read_u64(offsets::PREVIOUS_COMMIT_PAGE),
            roots,
        })
    }

    /// Pick the head from the two slot candidates.
    ///
    /// The valid candidate with the highest transaction id wins. Fails only
    /// when neither slot holds a valid header.
    pub fn select_head(
        slot0: Result<Self, HeaderError>,
        slot1: Result<Self, HeaderError>,
    ) -> Result<Self, HeaderError> {
        match (slot0, slot1) {
            (Ok(a), Ok(b)) => Ok(if b.transaction_id > a.transaction_id {
                b
            } else {
                a
            }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e0), Err(e1)) => Err(HeaderError::NoValidHeader {
                slot0: Box::new(e0),
                slot1: Box::new(e1),
            }),
        }
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Errors that can occur when reading or writing a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// Page failed checksum or type validation.
    Page(PageError),
    /// The slot could not be read from storage.
    Unreadable(String),
    /// Page is not a header of the expected kind.
    WrongPageType(PageType),
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
    /// Unknown persistence strategy byte.
    InvalidStrategy(u8),
    /// Root table runs past the end of the page.
    Truncated,
    /// Root table does not fit in one page.
    RootsTooLarge,
    /// Root names are limited to 255 bytes.
    RootNameTooLong(String),
    /// Neither header slot holds a valid header.
    NoValidHeader {
        slot0: Box<HeaderError>,
        slot1: Box<HeaderError>,
    },
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "{e}"),
            Self::Unreadable(e) => write!(f, "unreadable: {e}"),
            Self::WrongPageType(t) => write!(f, "unexpected page type {t:?}"),
            Self::InvalidMagic(m) => write!(f, "invalid magic number: {m:?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::InvalidStrategy(s) => write!(f, "invalid persistence strategy: {s}"),
            Self::Truncated => write!(f, "root table is truncated"),
            Self::RootsTooLarge => write!(f, "root table does not fit in a header page"),
            Self::RootNameTooLong(name) => write!(f, "root name too long: {name}"),
            Self::NoValidHeader { slot0, slot1 } => {
                write!(f, "no valid header (slot 0: {slot0}; slot 1: {slot1})")
            }
        }
    }
}

impl std::error::Error for HeaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}
