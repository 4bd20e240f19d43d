//! Overflow chains for large values.
//!
//! Values too large to live inline in a B+Tree leaf are stored in a chain of
//! overflow pages and the leaf keeps an [`OverflowRef`].
//!
//! # Overflow Page Format
//!
//! ```text
//! +----------------+----------------+----------------+------------------+
//! | Page Header    | Next Page ID   | Data Length    | Data...          |
//! | (8 bytes)      | (8 bytes)      | (4 bytes)      | (variable)       |
//! +----------------+----------------+----------------+------------------+
//! ```
//!
//! Pages are immutable once written, so a chain is written back to front:
//! every page already knows its successor when it is written.

// Chunk sizes are bounded by PAGE_SIZE and values by u32::MAX.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::storage::page_store::{PageRead, PageStoreError, PageWrite};

/// Size of overflow page header (after page header).
/// - Next page ID: 8 bytes
/// - Data length in this page: 4 bytes
const OVERFLOW_HEADER_SIZE: usize = 12;

const NEXT_PAGE_OFFSET: usize = PageHeader::SIZE;
const DATA_LENGTH_OFFSET: usize = PageHeader::SIZE + 8;

/// Offset where overflow data starts.
const OVERFLOW_DATA_OFFSET: usize = PageHeader::SIZE + OVERFLOW_HEADER_SIZE;

/// Maximum data per overflow page.
pub const OVERFLOW_DATA_PER_PAGE: usize = PAGE_SIZE - OVERFLOW_DATA_OFFSET;

/// Size of an encoded overflow reference.
/// - Page ID: 8 bytes
/// - Total length: 4 bytes
pub const OVERFLOW_REF_SIZE: usize = 12;

/// Reference to a value stored in an overflow chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowRef {
    /// First page of the overflow chain.
    pub first_page: PageId,
    /// Total length of the value.
    pub total_length: u32,
}

impl OverflowRef {
    #[must_use]
    pub const fn new(first_page: PageId, total_length: u32) -> Self {
        Self {
            first_page,
            total_length,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; OVERFLOW_REF_SIZE] {
        let mut buf = [0u8; OVERFLOW_REF_SIZE];
        buf[0..8].copy_from_slice(&self.first_page.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_length.to_le_bytes());
        buf
    }

    /// Returns `None` if fewer than [`OVERFLOW_REF_SIZE`] bytes are given.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < OVERFLOW_REF_SIZE {
            return None;
        }
        let mut first_page = [0u8; 8];
        first_page.copy_from_slice(&bytes[0..8]);
        let mut total_length = [0u8; 4];
        total_length.copy_from_slice(&bytes[8..12]);
        Some(Self {
            first_page: u64::from_le_bytes(first_page),
            total_length: u32::from_le_bytes(total_length),
        })
    }

    /// Number of pages in the chain.
    #[must_use]
    pub const fn page_count(&self) -> usize {
        (self.total_length as usize).div_ceil(OVERFLOW_DATA_PER_PAGE)
    }
}

/// Write a value to a new overflow chain.
pub fn write_overflow<W: PageWrite>(pages: &mut W, value: &[u8]) -> Result<OverflowRef, PageStoreError> {
    let total_length = u32::try_from(value.len()).map_err(|_| PageStoreError::Corruption {
        page_id: 0,
        reason: format!("value of {} bytes exceeds the overflow limit", value.len()),
    })?;

    let chunks: Vec<&[u8]> = value.chunks(OVERFLOW_DATA_PER_PAGE).collect();
    let mut page_ids = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        page_ids.push(pages.allocate_page()?);
    }

    let mut next_page = 0;
    for (chunk, page_id) in chunks.iter().zip(&page_ids).rev() {
        let mut page = Page::with_type(PageType::Overflow);
        page.write_u64(NEXT_PAGE_OFFSET, next_page);
        page.write_u32(DATA_LENGTH_OFFSET, chunk.len() as u32);
        page.write_bytes(OVERFLOW_DATA_OFFSET, chunk);
        pages.write_page(*page_id, page)?;
        next_page = *page_id;
    }

    Ok(OverflowRef::new(next_page, total_length))
}

/// Read a value back from its overflow chain.
pub fn read_overflow<R: PageRead>(pages: &R, overflow_ref: &OverflowRef) -> Result<Vec<u8>, PageStoreError> {
    let mut result = Vec::with_capacity(overflow_ref.total_length as usize);
    let mut current = overflow_ref.first_page;

    while current != 0 {
        let page = pages.read_page(current)?;
        let (next, data) = chunk_of(&page, current)?;
        result.extend_from_slice(data);
        if result.len() > overflow_ref.total_length as usize {
            break;
        }
        current = next;
    }

    if result.len() != overflow_ref.total_length as usize {
        return Err(PageStoreError::Corruption {
            page_id: overflow_ref.first_page,
            reason: format!(
                "overflow chain holds {} bytes, expected {}",
                result.len(),
                overflow_ref.total_length
            ),
        });
    }
    Ok(result)
}

/// Every page of an overflow chain, in chain order.
pub fn overflow_pages<R: PageRead>(pages: &R, overflow_ref: &OverflowRef) -> Result<Vec<PageId>, PageStoreError> {
    let mut ids = Vec::with_capacity(overflow_ref.page_count());
    let mut current = overflow_ref.first_page;
    while current != 0 {
        if ids.len() > overflow_ref.page_count() {
            return Err(PageStoreError::Corruption {
                page_id: overflow_ref.first_page,
                reason: "overflow chain longer than its value".to_string(),
            });
        }
        ids.push(current);
        current = next_overflow_page(&*pages.read_page(current)?, current)?;
    }
    Ok(ids)
}

/// Successor of an overflow page (0 at the end of the chain).
pub fn next_overflow_page(page: &Page, page_id: PageId) -> Result<PageId, PageStoreError> {
    chunk_of(page, page_id).map(|(next, _)| next)
}

fn chunk_of(page: &Page, page_id: PageId) -> Result<(PageId, &[u8]), PageStoreError> {
    match page.page_type() {
        Ok(PageType::Overflow) => {}
        other => {
            return Err(PageStoreError::Corruption {
                page_id,
                reason: format!("expected overflow page, found {other:?}"),
            });
        }
    }
    let data_length = page.read_u32(DATA_LENGTH_OFFSET) as usize;
    if data_length > OVERFLOW_DATA_PER_PAGE {
        return Err(PageStoreError::Corruption {
            page_id,
            reason: format!("overflow data length {data_length} exceeds page capacity"),
        });
    }
    Ok((
        page.read_u64(NEXT_PAGE_OFFSET),
        page.read_bytes(OVERFLOW_DATA_OFFSET, data_length),
    ))
}
