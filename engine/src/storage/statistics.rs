//! Per-commit store statistics.
//!
//! Every commit appends one [`StoreStatisticsRecord`] to an immutable chain
//! of statistics pages. The newest page is published as a root, and each page
//! links to the record of the previous commit.
//!
//! # Record Text Format
//!
//! ```text
//! 42            commit number
//! 100           total triple count
//! 60,urn:p1     count,predicate (zero or more)
//! 40,urn:p2
//! END
//! ```
//!
//! # Statistics Page Format
//!
//! ```text
//! +-------------+---------------+---------------+--------+----------+---------+
//! | Page Header | Previous Page | Commit Number | Kind   | Length   | Payload |
//! | (8 bytes)   | (8 bytes)     | (8 bytes)     | (1+3)  | (4)      |         |
//! +-------------+---------------+---------------+--------+----------+---------+
//! ```
//!
//! The payload is the record text, or an overflow reference when the text
//! does not fit in the page.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use tracing::{debug, warn};

use crate::storage::overflow::{
    OVERFLOW_REF_SIZE, OverflowRef, overflow_pages, read_overflow, write_overflow,
};
use crate::storage::page::{NULL_PAGE, PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::storage::page_store::{PageRead, PageStoreError, PageWrite};

const PREVIOUS_OFFSET: usize = PageHeader::SIZE;
const COMMIT_OFFSET: usize = PageHeader::SIZE + 8;
const KIND_OFFSET: usize = PageHeader::SIZE + 16;
const LENGTH_OFFSET: usize = PageHeader::SIZE + 20;
const PAYLOAD_OFFSET: usize = PageHeader::SIZE + 24;
const MAX_INLINE_PAYLOAD: usize = PAGE_SIZE - PAYLOAD_OFFSET;

const KIND_INLINE: u8 = 0;
const KIND_OVERFLOW: u8 = 1;

const END_MARKER: &str = "END";

/// Triple counts as of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStatisticsRecord {
    pub commit_number: u64,
    pub total_triple_count: u64,
    pub predicate_triple_counts: BTreeMap<String, u64>,
}

impl StoreStatisticsRecord {
    #[must_use]
    pub const fn new(
        commit_number: u64,
        total_triple_count: u64,
        predicate_triple_counts: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            commit_number,
            total_triple_count,
            predicate_triple_counts,
        }
    }

    /// Write the record in its text form.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<(), StatisticsError> {
        writeln!(writer, "{}", self.commit_number)?;
        writeln!(writer, "{}", self.total_triple_count)?;
        for (predicate, count) in &self.predicate_triple_counts {
            writeln!(writer, "{count},{predicate}")?;
        }
        writeln!(writer, "{END_MARKER}")?;
        Ok(())
    }

    /// Read one record in its text form.
    ///
    /// Stops after the `END` line, so several records can share a stream.
    pub fn load<R: BufRead>(reader: &mut R) -> Result<Self, StatisticsError> {
        let mut lines = reader.lines();
        let mut line_number = 0;
        let mut next_line = |line_number: &mut usize| -> Result<String, StatisticsError> {
            *line_number += 1;
            match lines.next() {
                Some(line) => Ok(line?),
                None => Err(StatisticsError::Format {
                    line: *line_number,
                    reason: "unexpected end of input".to_string(),
                }),
            }
        };

        let commit_number = parse_count(&next_line(&mut line_number)?, line_number, "commit number")?;
        let total_triple_count =
            parse_count(&next_line(&mut line_number)?, line_number, "total triple count")?;

        let mut predicate_triple_counts = BTreeMap::new();
        loop {
            let line = next_line(&mut line_number)?;
            let line = line.trim_end_matches('\r');
            if line == END_MARKER {
                break;
            }
            let Some((count, predicate)) = line.split_once(',') else {
                return Err(StatisticsError::Format {
                    line: line_number,
                    reason: format!("expected `count,predicate`, found {line:?}"),
                });
            };
            let count = parse_count(count, line_number, "predicate count")?;
            if predicate_triple_counts
                .insert(predicate.to_string(), count)
                .is_some()
            {
                return Err(StatisticsError::Format {
                    line: line_number,
                    reason: format!("predicate {predicate:?} listed twice"),
                });
            }
        }

        Ok(Self {
            commit_number,
            total_triple_count,
            predicate_triple_counts,
        })
    }

    fn to_text(&self) -> Result<Vec<u8>, StatisticsError> {
        let mut buf = Vec::new();
        self.save(&mut buf)?;
        Ok(buf)
    }
}

fn parse_count(text: &str, line: usize, what: &str) -> Result<u64, StatisticsError> {
    text.trim_end_matches('\r')
        .parse()
        .map_err(|_| StatisticsError::Format {
            line,
            reason: format!("invalid {what} {text:?}"),
        })
}

/// Derives the next record from the previous one.
#[derive(Debug, Clone, Default)]
pub struct StatisticsBuilder {
    total: u64,
    predicates: BTreeMap<String, u64>,
    changed: bool,
}

impl StatisticsBuilder {
    #[must_use]
    pub fn from_record(record: &StoreStatisticsRecord) -> Self {
        Self {
            total: record.total_triple_count,
            predicates: record.predicate_triple_counts.clone(),
            changed: false,
        }
    }

    /// Count `count` new triples with `predicate`.
    pub fn add(&mut self, predicate: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.total = self.total.saturating_add(count);
        let entry = self.predicates.entry(predicate.to_string()).or_default();
        *entry = entry.saturating_add(count);
        self.changed = true;
    }

    /// Count `count` removed triples with `predicate`. Counts never go
    /// below zero and predicates reaching zero are dropped.
    pub fn remove(&mut self, predicate: &str, count: u64) {
        let Some(current) = self.predicates.get_mut(predicate) else {
            return;
        };
        let removed = count.min(*current);
        if removed == 0 {
            return;
        }
        *current -= removed;
        if *current == 0 {
            self.predicates.remove(predicate);
        }
        self.total = self.total.saturating_sub(removed);
        self.changed = true;
    }

    #[must_use]
    pub const fn is_changed(&self) -> bool {
        self.changed
    }

    #[must_use]
    pub fn build(&self, commit_number: u64) -> StoreStatisticsRecord {
        StoreStatisticsRecord {
            commit_number,
            total_triple_count: self.total,
            predicate_triple_counts: self.predicates.clone(),
        }
    }
}

/// The chain of statistics pages ending at `head`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsLog {
    head: PageId,
}

impl StatisticsLog {
    #[must_use]
    pub const fn new(head: PageId) -> Self {
        Self { head }
    }

    #[must_use]
    pub const fn head(&self) -> PageId {
        self.head
    }

    /// Append a record and return the new head page.
    pub fn append<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        record: &StoreStatisticsRecord,
    ) -> Result<PageId, StatisticsError> {
        self.head = write_record(pages, self.head, record)?;
        Ok(self.head)
    }

    /// Start a new log holding only `record` and retire every page of the
    /// old one.
    pub fn replace<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        record: &StoreStatisticsRecord,
    ) -> Result<PageId, StatisticsError> {
        let superseded = match self.page_ids(&*pages) {
            Ok(ids) => ids,
            Err(StatisticsError::Store(PageStoreError::Corruption { page_id, reason })) => {
                warn!(page_id, reason, "statistics log is damaged; its pages are not reclaimed");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let head = write_record(pages, NULL_PAGE, record)?;
        for page_id in superseded {
            pages.retire_page(page_id);
        }
        self.head = head;
        Ok(head)
    }

    /// Every page of the log, overflow chains included.
    pub fn page_ids<R: PageRead>(&self, pages: &R) -> Result<Vec<PageId>, StatisticsError> {
        let mut ids = Vec::new();
        let mut next = self.head;
        while next != NULL_PAGE {
            let page = pages.read_page(next)?;
            ids.push(next);
            if page.read_u8(KIND_OFFSET) == KIND_OVERFLOW {
                let payload = page.read_bytes(PAYLOAD_OFFSET, OVERFLOW_REF_SIZE);
                if let Some(overflow) = OverflowRef::from_bytes(payload) {
                    ids.extend(overflow_pages(pages, &overflow)?);
                }
            }
            next = page.read_u64(PREVIOUS_OFFSET);
        }
        Ok(ids)
    }

    /// The newest record, if any.
    pub fn latest<R: PageRead>(&self, pages: &R) -> Result<Option<StoreStatisticsRecord>, StatisticsError> {
        self.records(pages).next().transpose()
    }

    /// The newest record that decodes.
    ///
    /// Malformed records and corrupt pages are skipped with a warning so a
    /// damaged record never blocks later commits. Other page store failures
    /// are returned.
    pub fn latest_readable<R: PageRead>(
        &self,
        pages: &R,
    ) -> Result<Option<StoreStatisticsRecord>, StatisticsError> {
        for item in self.records(pages) {
            match item {
                Ok(record) => return Ok(Some(record)),
                Err(StatisticsError::Store(e)) if !matches!(e, PageStoreError::Corruption { .. }) => {
                    return Err(StatisticsError::Store(e));
                }
                Err(e) => warn!(head = self.head, error = %e, "skipping unreadable statistics record"),
            }
        }
        Ok(None)
    }

    /// Every record, newest first.
    ///
    /// A record that fails to decode is reported on its own; the older
    /// records behind it are still returned.
    #[must_use]
    pub const fn records<'a, R: PageRead>(&self, pages: &'a R) -> StatisticsRecords<'a, R> {
        StatisticsRecords {
            pages,
            next: self.head,
        }
    }
}

/// Write one record page pointing at `previous`.
fn write_record<S: PageRead + PageWrite>(
    pages: &mut S,
    previous: PageId,
    record: &StoreStatisticsRecord,
) -> Result<PageId, StatisticsError> {
    let text = record.to_text()?;
    let (kind, payload) = if text.len() > MAX_INLINE_PAYLOAD {
        let overflow = write_overflow(pages, &text)?;
        (KIND_OVERFLOW, overflow.to_bytes().to_vec())
    } else {
        (KIND_INLINE, text)
    };

    let page_id = pages.allocate_page()?;
    let mut page = Page::with_type(PageType::Statistics);
    page.write_u64(PREVIOUS_OFFSET, previous);
    page.write_u64(COMMIT_OFFSET, record.commit_number);
    page.write_u8(KIND_OFFSET, kind);
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_INLINE_PAYLOAD
    page.write_u32(LENGTH_OFFSET, payload.len() as u32);
    page.write_bytes(PAYLOAD_OFFSET, &payload);
    pages.write_page(page_id, page)?;

    debug!(
        page_id,
        commit = record.commit_number,
        total = record.total_triple_count,
        "wrote statistics record"
    );
    Ok(page_id)
}

/// Iterator over a [`StatisticsLog`], newest first.
pub struct StatisticsRecords<'a, R> {
    pages: &'a R,
    next: PageId,
}

impl<R: PageRead> Iterator for StatisticsRecords<'_, R> {
    type Item = Result<StoreStatisticsRecord, StatisticsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NULL_PAGE {
            return None;
        }
        let page_id = self.next;
        let page = match self.pages.read_page(page_id) {
            Ok(page) => page,
            Err(e) => {
                self.next = NULL_PAGE;
                return Some(Err(e.into()));
            }
        };
        if !matches!(page.page_type(), Ok(PageType::Statistics)) {
            self.next = NULL_PAGE;
            return Some(Err(StatisticsError::Corruption {
                page_id,
                reason: "not a statistics page".to_string(),
            }));
        }
        self.next = page.read_u64(PREVIOUS_OFFSET);
        Some(decode_page(self.pages, &page, page_id))
    }
}

fn decode_page<R: PageRead>(pages: &R, page: &Page, page_id: PageId) -> Result<StoreStatisticsRecord, StatisticsError> {
    let corrupt = |reason: String| StatisticsError::Corruption { page_id, reason };

    let length = page.read_u32(LENGTH_OFFSET) as usize;
    if length > MAX_INLINE_PAYLOAD {
        return Err(corrupt(format!("payload length {length} exceeds the page")));
    }
    let payload = page.read_bytes(PAYLOAD_OFFSET, length);
    let text = match page.read_u8(KIND_OFFSET) {
        KIND_INLINE => payload.to_vec(),
        KIND_OVERFLOW if length == OVERFLOW_REF_SIZE => {
            let overflow = OverflowRef::from_bytes(payload)
                .ok_or_else(|| corrupt("short overflow reference".to_string()))?;
            read_overflow(pages, &overflow)?
        }
        kind => return Err(corrupt(format!("unknown payload kind {kind}"))),
    };

    let record = StoreStatisticsRecord::load(&mut text.as_slice())?;
    let commit_number = page.read_u64(COMMIT_OFFSET);
    if record.commit_number != commit_number {
        return Err(corrupt(format!(
            "record says commit {}, page says {commit_number}",
            record.commit_number
        )));
    }
    Ok(record)
}

/// Errors that can occur while saving or loading statistics.
#[derive(Debug)]
pub enum StatisticsError {
    /// The text form is malformed.
    Format { line: usize, reason: String },
    /// Reading or writing the text form failed.
    Io(std::io::Error),
    /// A statistics page is malformed.
    Corruption { page_id: PageId, reason: String },
    /// Page store error.
    Store(PageStoreError),
}

impl std::fmt::Display for StatisticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Format { line, reason } => {
                write!(f, "statistics format error on line {line}: {reason}")
            }
            Self::Io(e) => write!(f, "statistics I/O error: {e}"),
            Self::Corruption { page_id, reason } => {
                write!(f, "corrupt statistics page {page_id}: {reason}")
            }
            Self::Store(e) => write!(f, "page store error: {e}"),
        }
    }
}

impl std::error::Error for StatisticsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Format { .. } | Self::Corruption { .. } => None,
        }
    }
}

impl From<std::io::Error> for StatisticsError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<PageStoreError> for StatisticsError {
    fn from(e: PageStoreError) -> Self {
        Self::Store(e)
    }
}
