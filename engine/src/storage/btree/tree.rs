//! Copy-on-write B+Tree.
//!
//! A tree is a root page id plus a [`TreeLayout`]. Published pages are never
//! modified: every mutation copies the root-to-leaf path, writes the copies to
//! freshly allocated pages and reports the originals as retired. Subtrees off
//! the path keep their page ids and are shared between versions.
//!
//! Mutations are atomic from the caller's point of view. On error the tree
//! keeps its previous root and nothing is retired.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::storage::btree::node::{
    InternalNode, LeafEntry, LeafNode, Node, Rebalanced, StoredValue, TreeLayout,
};
use crate::storage::overflow::{
    OverflowRef, next_overflow_page, overflow_pages, read_overflow, write_overflow,
};
use crate::storage::page::{NULL_PAGE, Page, PageId};
use crate::storage::page_store::{PageRead, PageStoreError, PageWrite};

/// A B+Tree rooted at `root` (0 for the empty tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BPlusTree {
    layout: TreeLayout,
    root: PageId,
}

/// Internal nodes on the way from the root to a leaf, with the child taken.
type Path = Vec<(PageId, InternalNode, usize)>;

/// A node written during a mutation, possibly split in two.
enum Written {
    Single(PageId),
    Split(PageId, Vec<u8>, PageId),
}

impl BPlusTree {
    #[must_use]
    pub const fn new(layout: TreeLayout, root: PageId) -> Self {
        Self { layout, root }
    }

    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    #[must_use]
    pub const fn layout(&self) -> TreeLayout {
        self.layout
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root == NULL_PAGE
    }

    /// Look up a value by key.
    pub fn lookup<R: PageRead>(&self, pages: &R, key: &[u8]) -> Result<Option<Vec<u8>>, TreeError> {
        self.check_key(key)?;
        if self.is_empty() {
            return Ok(None);
        }
        let (_, _, leaf) = self.descend(pages, key)?;
        match leaf.find_index(key) {
            Ok(idx) => Ok(Some(materialize(pages, &leaf.entries[idx].value)?)),
            Err(_) => Ok(None),
        }
    }

    /// Insert a new key and return the new root.
    ///
    /// Fails with [`TreeError::DuplicateKey`] if the key is present; existing
    /// entries are never replaced.
    pub fn insert<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        key: &[u8],
        value: &[u8],
    ) -> Result<PageId, TreeError> {
        self.check_key(key)?;
        if let Some(expected) = self.layout.value_size().filter(|size| *size != value.len()) {
            return Err(TreeError::ValueSize {
                expected,
                actual: value.len(),
            });
        }

        if self.is_empty() {
            let leaf = LeafNode {
                entries: vec![LeafEntry {
                    key: key.to_vec(),
                    value: self.store_value(pages, value)?,
                }],
            };
            self.root = self.write_node(pages, &Node::Leaf(leaf))?;
            return Ok(self.root);
        }

        let (path, leaf_id, mut leaf) = self.descend(&*pages, key)?;
        let idx = match leaf.find_index(key) {
            Ok(_) => return Err(TreeError::DuplicateKey { page_id: leaf_id }),
            Err(idx) => idx,
        };
        leaf.entries.insert(
            idx,
            LeafEntry {
                key: key.to_vec(),
                value: self.store_value(pages, value)?,
            },
        );

        let mut retired = vec![leaf_id];
        let mut written = self.write_with_split(pages, Node::Leaf(leaf))?;
        for (page_id, mut parent, child_idx) in path.into_iter().rev() {
            retired.push(page_id);
            match written {
                Written::Single(child) => parent.children[child_idx] = child,
                Written::Split(left, separator, right) => {
                    parent.children[child_idx] = left;
                    parent.keys.insert(child_idx, separator);
                    parent.children.insert(child_idx + 1, right);
                }
            }
            written = self.write_with_split(pages, Node::Internal(parent))?;
        }

        let root = match written {
            Written::Single(root) => root,
            Written::Split(left, separator, right) => {
                debug!(left, right, "tree grew a level");
                let root = InternalNode::with_children(left, separator, right);
                self.write_node(pages, &Node::Internal(root))?
            }
        };

        for page_id in retired {
            pages.retire_page(page_id);
        }
        self.root = root;
        Ok(root)
    }

    /// Delete a key and return the new root.
    pub fn delete<S: PageRead + PageWrite>(
        &mut self,
        pages: &mut S,
        key: &[u8],
    ) -> Result<PageId, TreeError> {
        self.check_key(key)?;
        if self.is_empty() {
            return Err(TreeError::NotFound);
        }

        let (path, leaf_id, mut leaf) = self.descend(&*pages, key)?;
        let idx = leaf.find_index(key).map_err(|_| TreeError::NotFound)?;
        let removed = leaf.entries.remove(idx);

        let mut retired = vec![leaf_id];
        if let StoredValue::Overflow(overflow) = &removed.value {
            retired.extend(overflow_pages(&*pages, overflow)?);
        }

        let mut current = Node::Leaf(leaf);
        for (page_id, mut parent, child_idx) in path.into_iter().rev() {
            retired.push(page_id);
            self.place_child(pages, &mut parent, child_idx, current, &mut retired)?;
            current = Node::Internal(parent);
        }

        let root = match current {
            Node::Leaf(leaf) if leaf.entries.is_empty() => NULL_PAGE,
            Node::Internal(node) if node.keys.is_empty() => {
                debug!("tree lost a level");
                node.children.first().copied().unwrap_or(NULL_PAGE)
            }
            node => self.write_node(pages, &node)?,
        };

        for page_id in retired {
            pages.retire_page(page_id);
        }
        self.root = root;
        Ok(root)
    }

    /// Iterate over the entries between two bounds in ascending key order.
    ///
    /// Pages are read lazily as the iterator advances. Calling this again
    /// restarts the scan.
    #[must_use]
    pub fn range_scan<R: PageRead>(
        &self,
        pages: R,
        low: Bound<&[u8]>,
        high: Bound<&[u8]>,
    ) -> RangeScan<R> {
        RangeScan {
            tree: *self,
            pages,
            low: low.map(<[u8]>::to_vec),
            high: high.map(<[u8]>::to_vec),
            stack: Vec::new(),
            entries: Vec::new().into_iter(),
            started: false,
            done: false,
        }
    }

    /// Smallest entry.
    pub fn first<R: PageRead>(&self, pages: &R) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        self.range_scan(pages, Bound::Unbounded, Bound::Unbounded)
            .next()
            .transpose()
    }

    /// Largest entry.
    pub fn last<R: PageRead>(&self, pages: &R) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        let mut page_id = self.root;
        while page_id != NULL_PAGE {
            match self.read_node(pages, page_id)? {
                Node::Internal(node) => {
                    page_id = node.children.last().copied().unwrap_or(NULL_PAGE);
                }
                Node::Leaf(leaf) => {
                    return match leaf.entries.last() {
                        Some(entry) => Ok(Some((
                            entry.key.clone(),
                            materialize(pages, &entry.value)?,
                        ))),
                        None => Ok(None),
                    };
                }
            }
        }
        Ok(None)
    }

    /// Number of entries.
    pub fn len<R: PageRead>(&self, pages: &R) -> Result<usize, TreeError> {
        let mut count = 0;
        let mut pending = Vec::new();
        if !self.is_empty() {
            pending.push(self.root);
        }
        while let Some(page_id) = pending.pop() {
            match self.read_node(pages, page_id)? {
                Node::Internal(node) => pending.extend(node.children),
                Node::Leaf(leaf) => count += leaf.entries.len(),
            }
        }
        Ok(count)
    }

    /// Visit up to `limit` pages of the tree breadth first: every node level
    /// by level, then the overflow chains. Returns the number visited.
    pub fn walk<R, F>(&self, pages: &R, limit: usize, mut visit: F) -> Result<usize, PageStoreError>
    where
        R: PageRead,
        F: FnMut(PageId, &Arc<Page>),
    {
        let mut visited = 0;
        let mut queue = VecDeque::new();
        let mut chains: Vec<OverflowRef> = Vec::new();
        if !self.is_empty() {
            queue.push_back(self.root);
        }

        while let Some(page_id) = queue.pop_front() {
            if visited >= limit {
                return Ok(visited);
            }
            let page = pages.read_page(page_id)?;
            visit(page_id, &page);
            visited += 1;
            match Node::from_page(&page, page_id, &self.layout)? {
                Node::Internal(node) => queue.extend(node.children),
                Node::Leaf(leaf) => {
                    chains.extend(leaf.entries.into_iter().filter_map(|e| match e.value {
                        StoredValue::Overflow(overflow) => Some(overflow),
                        StoredValue::Inline(_) => None,
                    }));
                }
            }
        }

        for chain in chains {
            let mut page_id = chain.first_page;
            while page_id != NULL_PAGE {
                if visited >= limit {
                    return Ok(visited);
                }
                let page = pages.read_page(page_id)?;
                visit(page_id, &page);
                visited += 1;
                page_id = next_overflow_page(&page, page_id)?;
            }
        }
        Ok(visited)
    }

    /// Every page reachable from the root.
    pub fn page_ids<R: PageRead>(&self, pages: &R) -> Result<Vec<PageId>, PageStoreError> {
        let mut ids = Vec::new();
        self.walk(pages, usize::MAX, |page_id, _| ids.push(page_id))?;
        Ok(ids)
    }

    pub fn page_count<R: PageRead>(&self, pages: &R) -> Result<usize, PageStoreError> {
        self.walk(pages, usize::MAX, |_, _| {})
    }

    fn check_key(&self, key: &[u8]) -> Result<(), TreeError> {
        if let Err(e) = self.layout.check() {
            return Err(e);
        }
        if key.len() == self.layout.key_size() {
            Ok(())
        } else {
            Err(TreeError::KeySize {
                expected: self.layout.key_size(),
                actual: key.len(),
            })
        }
    }

    fn read_node<R: PageRead>(&self, pages: &R, page_id: PageId) -> Result<Node, TreeError> {
        let page = pages.read_page(page_id)?;
        Ok(Node::from_page(&page, page_id, &self.layout)?)
    }

    /// Walk from the root to the leaf responsible for `key`.
    fn descend<R: PageRead>(&self, pages: &R, key: &[u8]) -> Result<(Path, PageId, LeafNode), TreeError> {
        let mut path = Vec::new();
        let mut page_id = self.root;
        loop {
            match self.read_node(pages, page_id)? {
                Node::Internal(node) => {
                    let idx = node.find_child_index(key);
                    let child = node.children[idx];
                    path.push((page_id, node, idx));
                    page_id = child;
                }
                Node::Leaf(leaf) => return Ok((path, page_id, leaf)),
            }
        }
    }

    fn store_value<W: PageWrite>(&self, pages: &mut W, value: &[u8]) -> Result<StoredValue, TreeError> {
        if value.len() > self.layout.max_inline_value() {
            Ok(StoredValue::Overflow(write_overflow(pages, value)?))
        } else {
            Ok(StoredValue::Inline(value.to_vec()))
        }
    }

    fn write_node<W: PageWrite>(&self, pages: &mut W, node: &Node) -> Result<PageId, TreeError> {
        let page_id = pages.allocate_page()?;
        pages.write_page(page_id, node.to_page(&self.layout))?;
        Ok(page_id)
    }

    fn write_with_split<W: PageWrite>(&self, pages: &mut W, node: Node) -> Result<Written, TreeError> {
        let layout = &self.layout;
        match node {
            Node::Leaf(leaf) if leaf.fits(layout) => {
                Ok(Written::Single(self.write_node(pages, &Node::Leaf(leaf))?))
            }
            Node::Leaf(mut leaf) => {
                let (separator, right) = leaf.split(layout);
                let left_id = self.write_node(pages, &Node::Leaf(leaf))?;
                let right_id = self.write_node(pages, &Node::Leaf(right))?;
                debug!(left = left_id, right = right_id, "split leaf");
                Ok(Written::Split(left_id, separator, right_id))
            }
            Node::Internal(node) if node.fits(layout) => {
                Ok(Written::Single(self.write_node(pages, &Node::Internal(node))?))
            }
            Node::Internal(mut node) => {
                let (separator, right) = node.split();
                let left_id = self.write_node(pages, &Node::Internal(node))?;
                let right_id = self.write_node(pages, &Node::Internal(right))?;
                debug!(left = left_id, right = right_id, "split internal node");
                Ok(Written::Split(left_id, separator, right_id))
            }
        }
    }

    /// Write a modified child into `parent`, rebalancing it with a sibling
    /// when it has become underfull.
    fn place_child<S: PageRead + PageWrite>(
        &self,
        pages: &mut S,
        parent: &mut InternalNode,
        child_idx: usize,
        child: Node,
        retired: &mut Vec<PageId>,
    ) -> Result<(), TreeError> {
        let layout = &self.layout;
        let underfull = match &child {
            Node::Leaf(leaf) => leaf.is_underfull(layout),
            Node::Internal(node) => node.is_underfull(layout),
        };
        if !underfull || parent.children.len() < 2 {
            parent.children[child_idx] = self.write_node(pages, &child)?;
            return Ok(());
        }

        // Pair with the right sibling, or the left one for the last child.
        let has_right = child_idx + 1 < parent.children.len();
        let left_idx = if has_right { child_idx } else { child_idx - 1 };
        let sibling_id = parent.children[if has_right { child_idx + 1 } else { left_idx }];
        let sibling = self.read_node(&*pages, sibling_id)?;
        retired.push(sibling_id);
        let (left, right) = if has_right {
            (child, sibling)
        } else {
            (sibling, child)
        };

        let separator = parent.keys.remove(left_idx);
        let rebalanced = match (left, right) {
            (Node::Leaf(left), Node::Leaf(right)) => match LeafNode::rebalance(left, right, layout) {
                Rebalanced::Merged(node) => Rebalanced::Merged(Node::Leaf(node)),
                Rebalanced::Redistributed(left, separator, right) => {
                    Rebalanced::Redistributed(Node::Leaf(left), separator, Node::Leaf(right))
                }
            },
            (Node::Internal(left), Node::Internal(right)) => {
                match InternalNode::rebalance(left, separator, right, layout) {
                    Rebalanced::Merged(node) => Rebalanced::Merged(Node::Internal(node)),
                    Rebalanced::Redistributed(left, separator, right) => Rebalanced::Redistributed(
                        Node::Internal(left),
                        separator,
                        Node::Internal(right),
                    ),
                }
            }
            _ => {
                return Err(TreeError::Store(PageStoreError::Corruption {
                    page_id: sibling_id,
                    reason: "sibling nodes at different depths".to_string(),
                }));
            }
        };

        match rebalanced {
            Rebalanced::Merged(node) => {
                let merged = self.write_node(pages, &node)?;
                parent.children.remove(left_idx + 1);
                parent.children[left_idx] = merged;
                debug!(page_id = merged, "merged siblings");
            }
            Rebalanced::Redistributed(left, separator, right) => {
                parent.children[left_idx] = self.write_node(pages, &left)?;
                parent.children[left_idx + 1] = self.write_node(pages, &right)?;
                parent.keys.insert(left_idx, separator);
            }
        }
        Ok(())
    }
}

fn materialize<R: PageRead>(pages: &R, value: &StoredValue) -> Result<Vec<u8>, TreeError> {
    match value {
        StoredValue::Inline(bytes) => Ok(bytes.clone()),
        StoredValue::Overflow(overflow) => Ok(read_overflow(pages, overflow)?),
    }
}

/// Lazy ascending iterator over a key range.
///
/// Holds the root-to-leaf stack of the current position instead of following
/// sibling links.
pub struct RangeScan<R> {
    tree: BPlusTree,
    pages: R,
    low: Bound<Vec<u8>>,
    high: Bound<Vec<u8>>,
    /// Internal nodes on the current path and the next child to visit.
    stack: Vec<(InternalNode, usize)>,
    entries: std::vec::IntoIter<LeafEntry>,
    started: bool,
    done: bool,
}

impl<R: PageRead> RangeScan<R> {
    fn seek(&mut self) -> Result<(), TreeError> {
        let mut page_id = self.tree.root;
        while page_id != NULL_PAGE {
            match self.tree.read_node(&self.pages, page_id)? {
                Node::Internal(node) => {
                    let idx = match &self.low {
                        Bound::Unbounded => 0,
                        Bound::Included(key) | Bound::Excluded(key) => node.find_child_index(key),
                    };
                    page_id = node.children[idx];
                    self.stack.push((node, idx + 1));
                }
                Node::Leaf(leaf) => {
                    let start = match &self.low {
                        Bound::Unbounded => 0,
                        Bound::Included(key) => leaf.find_index(key).unwrap_or_else(|idx| idx),
                        Bound::Excluded(key) => match leaf.find_index(key) {
                            Ok(idx) => idx + 1,
                            Err(idx) => idx,
                        },
                    };
                    let mut entries = leaf.entries;
                    entries.drain(..start);
                    self.entries = entries.into_iter();
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Move to the leftmost leaf of the next subtree on the stack.
    fn next_leaf(&mut self) -> Result<bool, TreeError> {
        let mut page_id = loop {
            let Some((node, next)) = self.stack.last_mut() else {
                return Ok(false);
            };
            if *next < node.children.len() {
                let child = node.children[*next];
                *next += 1;
                break child;
            }
            self.stack.pop();
        };

        loop {
            match self.tree.read_node(&self.pages, page_id)? {
                Node::Internal(node) => {
                    page_id = node.children[0];
                    self.stack.push((node, 1));
                }
                Node::Leaf(leaf) => {
                    self.entries = leaf.entries.into_iter();
                    return Ok(true);
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, TreeError> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }
        loop {
            if let Some(entry) = self.entries.next() {
                let past_end = match &self.high {
                    Bound::Unbounded => false,
                    Bound::Included(high) => entry.key > *high,
                    Bound::Excluded(high) => entry.key >= *high,
                };
                if past_end {
                    return Ok(None);
                }
                let value = materialize(&self.pages, &entry.value)?;
                return Ok(Some((entry.key, value)));
            }
            if !self.next_leaf()? {
                return Ok(None);
            }
        }
    }
}

impl<R: PageRead> Iterator for RangeScan<R> {
    type Item = Result<(Vec<u8>, Vec<u8>), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Errors that can occur during B+Tree operations.
#[derive(Debug)]
pub enum TreeError {
    /// The key is already present in the leaf with this page id.
    DuplicateKey { page_id: PageId },
    /// The key is not in the tree.
    NotFound,
    /// The key does not have the tree's key size, or the layout's key size
    /// is larger than a page allows.
    KeySize { expected: usize, actual: usize },
    /// The value does not have the tree's fixed value size, or the layout's
    /// fixed value size is larger than a page allows.
    ValueSize { expected: usize, actual: usize },
    /// Page store error.
    Store(PageStoreError),
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey { page_id } => write!(f, "duplicate key in leaf page {page_id}"),
            Self::NotFound => write!(f, "key not found"),
            Self::KeySize { expected, actual } => {
                write!(f, "key is {actual} bytes, tree expects {expected}")
            }
            Self::ValueSize { expected, actual } => {
                write!(f, "value is {actual} bytes, tree expects {expected}")
            }
            Self::Store(e) => write!(f, "page store error: {e}"),
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageStoreError> for TreeError {
    fn from(e: PageStoreError) -> Self {
        Self::Store(e)
    }
}
