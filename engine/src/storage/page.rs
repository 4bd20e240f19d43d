//! Page types and constants for the storage engine.
//!
//! The storage engine uses 8KB pages as the fundamental unit of I/O. Every
//! page starts with an 8 byte [`PageHeader`] whose CRC32 checksum is verified
//! each time the page is read back.

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier (0-indexed page number).
///
/// Page 0 holds a transaction header and is never a data page, so `0` doubles
/// as the null page id in on-disk links.
pub type PageId = u64;

/// The null page id, used to terminate chains and to denote an empty tree.
pub const NULL_PAGE: PageId = 0;

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Transaction header slot (pages 0 and 1 only)
    TransactionHeader = 0x01,
    /// B+Tree internal node
    BTreeInternal = 0x03,
    /// B+Tree leaf node
    BTreeLeaf = 0x04,
    /// Overflow page for large values
    Overflow = 0x05,
    /// One record of the statistics log
    Statistics = 0x08,
    /// Historical copy of a transaction header (append-only stores)
    CommitRecord = 0x09,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::TransactionHeader),
            0x03 => Ok(Self::BTreeInternal),
            0x04 => Ok(Self::BTreeLeaf),
            0x05 => Ok(Self::Overflow),
            0x08 => Ok(Self::Statistics),
            0x09 => Ok(Self::CommitRecord),
            _ => Err(value),
        }
    }
}

/// Byte range of the checksum inside the page header.
const CHECKSUM_RANGE: std::ops::Range<usize> = 2..6;

/// Common page header present at the start of every page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[CHECKSUM_RANGE].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[CHECKSUM_RANGE]);
        Ok(Self {
            page_type,
            flags: bytes[1],
            checksum: u32::from_le_bytes(checksum),
        })
    }
}

/// A raw page buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Create a new zeroed page.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Create a zeroed page whose header carries the given type.
    #[must_use]
    pub fn with_type(page_type: PageType) -> Self {
        let mut page = Self::new();
        let header = PageHeader {
            page_type,
            flags: 0,
            checksum: 0,
        };
        page.write_bytes(0, &header.to_bytes());
        page
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[offset..offset + N]);
        out
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.array(offset))
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.array(offset))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.array(offset))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// CRC32 of the page with the checksum field read as zero.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..CHECKSUM_RANGE.start]);
        hasher.update(&[0u8; CHECKSUM_RANGE.end - CHECKSUM_RANGE.start]);
        hasher.update(&self.data[CHECKSUM_RANGE.end..]);
        hasher.finalize()
    }

    /// Store the current checksum in the header.
    ///
    /// Must be the last mutation before the page is handed to storage.
    pub fn seal(&mut self) {
        let checksum = self.compute_checksum();
        self.write_u32(CHECKSUM_RANGE.start, checksum);
    }

    /// Parse the header and check the stored checksum against the content.
    pub fn verify(&self) -> Result<PageHeader, PageError> {
        let header = PageHeader::from_bytes(self.array(0))?;

        let actual = self.compute_checksum();
        if header.checksum != actual {
            return Err(PageError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(header)
    }

    /// The type byte of this page, without checksum validation.
    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageType::try_from(self.data[0]).map_err(PageError::InvalidPageType)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}
