//! B+Tree node types and serialization.
//!
//! Nodes live in 8KB pages. Internal nodes hold separator keys and child
//! page ids; leaves hold the entries. There are no sibling or parent links:
//! copy-on-write would have to rewrite every neighbour of a changed node to
//! keep them up to date.
//!
//! # Node Format
//!
//! ```text
//! +----------------+----------------+-----------------------------------+
//! | Page Header    | Key Count      | Entries...                        |
//! | (8 bytes)      | (2 + 6 bytes)  |                                   |
//! +----------------+----------------+-----------------------------------+
//! ```
//!
//! Internal entries: `child[0]`, then `(key, child[i + 1])` pairs.
//!
//! Leaf entries with fixed-size values: `(key, value)`.
//! Leaf entries with variable values: `(key, u16 length, bytes)`. When the
//! top bit of the length is set the bytes are an [`OverflowRef`].

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::config::StoreConfig;
use crate::storage::btree::tree::TreeError;
use crate::storage::overflow::{OVERFLOW_REF_SIZE, OverflowRef};
use crate::storage::page::{PAGE_SIZE, Page, PageHeader, PageId, PageType};
use crate::storage::page_store::PageStoreError;

/// Node header layout (after page header):
/// - `key_count`: 2 bytes
/// - reserved: 6 bytes
const NODE_HEADER_SIZE: usize = 8;

const KEY_COUNT_OFFSET: usize = PageHeader::SIZE;

/// Offset where node data starts (after page header + node header).
const DATA_OFFSET: usize = PageHeader::SIZE + NODE_HEADER_SIZE;

/// Available space for node data.
pub const DATA_SPACE: usize = PAGE_SIZE - DATA_OFFSET;

/// Length prefix of a variable-size leaf value.
const VALUE_LENGTH_SIZE: usize = 2;

/// Set in a value length prefix when the value lives in an overflow chain.
const OVERFLOW_FLAG: u16 = 0x8000;

/// Shape of the keys and values stored in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLayout {
    key_size: usize,
    value_size: Option<usize>,
    max_keys: Option<usize>,
}

impl TreeLayout {
    /// Fixed-size keys and fixed-size values.
    #[must_use]
    pub const fn fixed(key_size: usize, value_size: usize) -> Self {
        Self {
            key_size,
            value_size: Some(value_size),
            max_keys: None,
        }
    }

    /// Fixed-size keys and variable-length values.
    #[must_use]
    pub const fn variable(key_size: usize) -> Self {
        Self {
            key_size,
            value_size: None,
            max_keys: None,
        }
    }

    /// Cap the branching factor below what the page size allows.
    #[must_use]
    pub fn with_max_keys(mut self, max_keys: Option<usize>) -> Self {
        self.max_keys = max_keys.map(|n| n.max(StoreConfig::MIN_KEYS_PER_NODE));
        self
    }

    #[must_use]
    pub const fn key_size(&self) -> usize {
        self.key_size
    }

    #[must_use]
    pub const fn value_size(&self) -> Option<usize> {
        self.value_size
    }

    /// Maximum number of keys in an internal node.
    ///
    /// `DATA_SPACE` = N * (`key_size` + 8) + 8
    #[must_use]
    pub fn max_internal_keys(&self) -> usize {
        let derived = (DATA_SPACE - 8) / (self.key_size + 8);
        self.max_keys.map_or(derived, |cap| cap.min(derived))
    }

    /// Maximum number of entries in a leaf.
    #[must_use]
    pub fn max_leaf_keys(&self) -> usize {
        let min_entry = self
            .value_size
            .map_or(self.key_size + VALUE_LENGTH_SIZE, |v| self.key_size + v);
        let derived = DATA_SPACE / min_entry.max(1);
        self.max_keys.map_or(derived, |cap| cap.min(derived))
    }

    /// Longest value stored inline; longer ones go to an overflow chain.
    ///
    /// Chosen so that at least four maximal entries fit in a leaf.
    #[must_use]
    pub const fn max_inline_value(&self) -> usize {
        match self.value_size {
            Some(size) => size,
            None => (DATA_SPACE / 4).saturating_sub(self.key_size + VALUE_LENGTH_SIZE),
        }
    }

    /// Largest key size this layout can store.
    ///
    /// Internal nodes must hold [`StoreConfig::MIN_KEYS_PER_NODE`] keys, and
    /// a variable-value leaf must hold four entries whose values are at
    /// least as long as an overflow reference.
    #[must_use]
    pub const fn max_key_size(&self) -> usize {
        match self.value_size {
            Some(_) => (DATA_SPACE - 8) / StoreConfig::MIN_KEYS_PER_NODE - 8,
            None => DATA_SPACE / 4 - VALUE_LENGTH_SIZE - OVERFLOW_REF_SIZE,
        }
    }

    /// Check that nodes of this layout fit in a page.
    pub const fn check(&self) -> Result<(), TreeError> {
        let max_key_size = self.max_key_size();
        if self.key_size > max_key_size {
            return Err(TreeError::KeySize {
                expected: max_key_size,
                actual: self.key_size,
            });
        }
        match self.value_size {
            Some(size) if self.key_size + size > DATA_SPACE => Err(TreeError::ValueSize {
                expected: DATA_SPACE - self.key_size,
                actual: size,
            }),
            _ => Ok(()),
        }
    }

    fn entry_size(&self, entry: &LeafEntry) -> usize {
        match self.value_size {
            Some(size) => self.key_size + size,
            None => {
                self.key_size
                    + VALUE_LENGTH_SIZE
                    + match &entry.value {
                        StoredValue::Inline(bytes) => bytes.len(),
                        StoredValue::Overflow(_) => OVERFLOW_REF_SIZE,
                    }
            }
        }
    }
}

/// A leaf value as stored in the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Inline(Vec<u8>),
    Overflow(OverflowRef),
}

/// A key-value entry in a leaf node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: StoredValue,
}

/// An internal (non-leaf) node.
///
/// Stores N keys and N+1 child pointers.
/// `Child[i]` contains keys < `Key[i]`
/// `Child[i+1]` contains keys >= `Key[i]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    /// Keys in sorted order.
    pub keys: Vec<Vec<u8>>,
    /// Child page pointers. `children.len()` == `keys.len()` + 1
    pub children: Vec<PageId>,
}

/// A leaf node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    /// Entries in sorted order by key.
    pub entries: Vec<LeafEntry>,
}

/// Any node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

/// Outcome of rebalancing two adjacent siblings.
#[derive(Debug)]
pub enum Rebalanced<N> {
    /// Both siblings fit in one node.
    Merged(N),
    /// Entries were shared out again; the key separates the two halves.
    Redistributed(N, Vec<u8>, N),
}

impl InternalNode {
    /// Create an internal node with two children.
    #[must_use]
    pub fn with_children(left_child: PageId, key: Vec<u8>, right_child: PageId) -> Self {
        Self {
            keys: vec![key],
            children: vec![left_child, right_child],
        }
    }

    /// Find the child index for a given key.
    #[must_use]
    pub fn find_child_index(&self, key: &[u8]) -> usize {
        match self
            .keys
            .binary_search_by(|entry| entry.as_slice().cmp(key))
        {
            Ok(i) => i + 1, // Exact match, go right
            Err(i) => i,    // Insert position
        }
    }

    #[must_use]
    pub fn fits(&self, layout: &TreeLayout) -> bool {
        self.keys.len() <= layout.max_internal_keys()
    }

    #[must_use]
    pub fn is_underfull(&self, layout: &TreeLayout) -> bool {
        self.keys.len() * 2 < layout.max_internal_keys()
    }

    /// Split the node, returning the median key and the new right node.
    ///
    /// The lower half keeps `ceil((n + 1) / 2)` children.
    #[must_use]
    pub fn split(&mut self) -> (Vec<u8>, Self) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let median = self.keys.pop().unwrap_or_default();
        (
            median,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }

    /// Merge or redistribute two adjacent siblings around their separator.
    #[must_use]
    pub fn rebalance(
        mut left: Self,
        separator: Vec<u8>,
        right: Self,
        layout: &TreeLayout,
    ) -> Rebalanced<Self> {
        left.keys.push(separator);
        left.keys.extend(right.keys);
        left.children.extend(right.children);
        if left.fits(layout) {
            return Rebalanced::Merged(left);
        }
        let (median, right) = left.split();
        Rebalanced::Redistributed(left, median, right)
    }
}

impl LeafNode {
    /// Find the index where a key should be inserted (or exists).
    pub fn find_index(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    /// Serialized size of all entries.
    #[must_use]
    pub fn encoded_size(&self, layout: &TreeLayout) -> usize {
        self.entries.iter().map(|e| layout.entry_size(e)).sum()
    }

    #[must_use]
    pub fn fits(&self, layout: &TreeLayout) -> bool {
        self.entries.len() <= layout.max_leaf_keys() && self.encoded_size(layout) <= DATA_SPACE
    }

    /// Fewer than half the branching factor in keys and less than a quarter
    /// of the page in bytes.
    #[must_use]
    pub fn is_underfull(&self, layout: &TreeLayout) -> bool {
        self.entries.len() * 2 < layout.max_leaf_keys()
            && self.encoded_size(layout) * 4 < DATA_SPACE
    }

    /// Split the node at its weight midpoint, returning the first key of the
    /// new right node and the node itself.
    ///
    /// The lower half never exceeds half of the encoded bytes unless a single
    /// entry does.
    #[must_use]
    pub fn split(&mut self, layout: &TreeLayout) -> (Vec<u8>, Self) {
        let sizes: Vec<usize> = self.entries.iter().map(|e| layout.entry_size(e)).collect();
        let mid = split_point(&sizes, layout.max_leaf_keys());
        let right_entries = self.entries.split_off(mid);
        let split_key = right_entries
            .first()
            .map(|e| e.key.clone())
            .unwrap_or_default();
        (
            split_key,
            Self {
                entries: right_entries,
            },
        )
    }

    /// Merge or redistribute two adjacent siblings.
    #[must_use]
    pub fn rebalance(mut left: Self, right: Self, layout: &TreeLayout) -> Rebalanced<Self> {
        left.entries.extend(right.entries);
        if left.fits(layout) {
            return Rebalanced::Merged(left);
        }
        let (separator, right) = left.split(layout);
        Rebalanced::Redistributed(left, separator, right)
    }
}

/// Index of the first entry of the upper half: the lower half takes as many
/// entries as fit in half of the total weight, kept within the count limit.
///
/// For `n = N + 1` equally sized entries the lower half keeps `ceil(N / 2)`.
fn split_point(sizes: &[usize], max_count: usize) -> usize {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();
    let mut acc = 0;
    let mut idx = 0;
    for size in sizes {
        if (acc + size) * 2 > total {
            break;
        }
        acc += size;
        idx += 1;
    }
    let low = n.saturating_sub(max_count).max(1);
    let high = max_count.min(n.saturating_sub(1));
    idx.max(low).min(high)
}

impl Node {
    /// Decode a node, checking that it is well formed for `layout`.
    pub fn from_page(page: &Page, page_id: PageId, layout: &TreeLayout) -> Result<Self, PageStoreError> {
        let corrupt = |reason: String| PageStoreError::Corruption { page_id, reason };

        let page_type = page
            .page_type()
            .map_err(|e| corrupt(e.to_string()))?;
        let count = usize::from(page.read_u16(KEY_COUNT_OFFSET));
        let key_size = layout.key_size;

        match page_type {
            PageType::BTreeInternal => {
                if DATA_OFFSET + 8 + count * (key_size + 8) > PAGE_SIZE {
                    return Err(corrupt(format!("internal node claims {count} keys")));
                }
                let mut keys = Vec::with_capacity(count);
                let mut children = Vec::with_capacity(count + 1);
                let mut offset = DATA_OFFSET;
                children.push(page.read_u64(offset));
                offset += 8;
                for _ in 0..count {
                    keys.push(page.read_bytes(offset, key_size).to_vec());
                    offset += key_size;
                    children.push(page.read_u64(offset));
                    offset += 8;
                }
                Ok(Self::Internal(InternalNode { keys, children }))
            }
            PageType::BTreeLeaf => {
                let mut entries = Vec::with_capacity(count);
                let mut offset = DATA_OFFSET;
                for _ in 0..count {
                    if offset + key_size > PAGE_SIZE {
                        return Err(corrupt("leaf entry runs past the page".to_string()));
                    }
                    let key = page.read_bytes(offset, key_size).to_vec();
                    offset += key_size;

                    let value = if let Some(size) = layout.value_size {
                        if offset + size > PAGE_SIZE {
                            return Err(corrupt("leaf value runs past the page".to_string()));
                        }
                        let bytes = page.read_bytes(offset, size).to_vec();
                        offset += size;
                        StoredValue::Inline(bytes)
                    } else {
                        if offset + VALUE_LENGTH_SIZE > PAGE_SIZE {
                            return Err(corrupt("leaf value runs past the page".to_string()));
                        }
                        let raw_len = page.read_u16(offset);
                        offset += VALUE_LENGTH_SIZE;
                        let len = if raw_len & OVERFLOW_FLAG == 0 {
                            usize::from(raw_len)
                        } else {
                            OVERFLOW_REF_SIZE
                        };
                        if offset + len > PAGE_SIZE {
                            return Err(corrupt("leaf value runs past the page".to_string()));
                        }
                        let bytes = page.read_bytes(offset, len);
                        offset += len;
                        if raw_len & OVERFLOW_FLAG == 0 {
                            StoredValue::Inline(bytes.to_vec())
                        } else {
                            let overflow = OverflowRef::from_bytes(bytes)
                                .ok_or_else(|| corrupt("short overflow reference".to_string()))?;
                            StoredValue::Overflow(overflow)
                        }
                    };
                    entries.push(LeafEntry { key, value });
                }
                let ordered = entries
                    .windows(2)
                    .all(|pair| pair[0].key.as_slice().cmp(&pair[1].key) == Ordering::Less);
                if !ordered {
                    return Err(corrupt("leaf keys out of order".to_string()));
                }
                Ok(Self::Leaf(LeafNode { entries }))
            }
            other => Err(corrupt(format!("expected a tree node, found {other:?}"))),
        }
    }

    /// Encode the node into an (unsealed) page.
    #[must_use]
    pub fn to_page(&self, layout: &TreeLayout) -> Page {
        match self {
            Self::Internal(node) => {
                let mut page = Page::with_type(PageType::BTreeInternal);
                page.write_u16(KEY_COUNT_OFFSET, node.keys.len() as u16);
                let mut offset = DATA_OFFSET;
                page.write_u64(offset, node.children.first().copied().unwrap_or(0));
                offset += 8;
                for (key, child) in node.keys.iter().zip(node.children.iter().skip(1)) {
                    page.write_bytes(offset, key);
                    offset += key.len();
                    page.write_u64(offset, *child);
                    offset += 8;
                }
                page
            }
            Self::Leaf(node) => {
                let mut page = Page::with_type(PageType::BTreeLeaf);
                page.write_u16(KEY_COUNT_OFFSET, node.entries.len() as u16);
                let mut offset = DATA_OFFSET;
                for entry in &node.entries {
                    page.write_bytes(offset, &entry.key);
                    offset += entry.key.len();
                    match (&entry.value, layout.value_size) {
                        (StoredValue::Inline(bytes), Some(_)) => {
                            page.write_bytes(offset, bytes);
                            offset += bytes.len();
                        }
                        (StoredValue::Inline(bytes), None) => {
                            page.write_u16(offset, bytes.len() as u16);
                            page.write_bytes(offset + VALUE_LENGTH_SIZE, bytes);
                            offset += VALUE_LENGTH_SIZE + bytes.len();
                        }
                        (StoredValue::Overflow(overflow), _) => {
                            page.write_u16(offset, OVERFLOW_FLAG);
                            page.write_bytes(offset + VALUE_LENGTH_SIZE, &overflow.to_bytes());
                            offset += VALUE_LENGTH_SIZE + OVERFLOW_REF_SIZE;
                        }
                    }
                }
                page
            }
        }
    }
}
