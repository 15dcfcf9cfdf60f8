//! # Tree Node Codec
//!
//! This module defines the on-disk format and the in-memory form of B+Tree
//! pages. Every tree page starts with a 4-byte header:
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  -------------------------------------
//! 0       2     kind    Node kind tag (leaf = 1, pointer = 2)
//! 2       2     count   Number of entries in the node
//! ```
//!
//! All multi-byte integers on disk are big-endian. The kind tag space is
//! shared with free-list pages (tag 3), which are decoded by the storage
//! layer rather than here; the tree never descends into one.
//!
//! ## Decoded representation
//!
//! Nodes are decoded into owned entry vectors and treated as immutable
//! values: every transformation (insert, update, delete, split, merge)
//! consumes the node and returns a new one. This is what makes the
//! copy-on-write protocol trivially safe, since a transformation can never
//! touch bytes that a concurrent snapshot still reads.
//!
//! ## Entry layouts
//!
//! ```text
//! Leaf entry:     key_len (2) | val_len (2) | key | value
//! Pointer entry:  key_len (2) | key | child page id (8)
//! ```
//!
//! Leaf keys are strictly increasing in byte-lexicographic order. A pointer
//! entry's key is the least key stored anywhere in its child subtree, and a
//! pointer node's entries are strictly increasing as well.

mod leaf;
mod pointer;

pub use leaf::LeafNode;
pub use pointer::PointerNode;

use eyre::{bail, ensure, Result};
use zerocopy::big_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::store::PageId;

pub const NODE_HEADER_SIZE: usize = 4;

/// Fixed per-entry overhead of a leaf entry (two 16-bit lengths).
pub const LEAF_ENTRY_OVERHEAD: usize = 4;

/// Fixed per-entry overhead of a pointer entry (16-bit length + 64-bit id).
pub const POINTER_ENTRY_OVERHEAD: usize = 10;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf = 1,
    Pointer = 2,
    FreeList = 3,
}

impl NodeKind {
    pub fn from_tag(tag: u16) -> Result<Self> {
        match tag {
            1 => Ok(NodeKind::Leaf),
            2 => Ok(NodeKind::Pointer),
            3 => Ok(NodeKind::FreeList),
            _ => bail!("bad node header: unknown kind tag {}", tag),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    kind: U16,
    count: U16,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn new(kind: NodeKind, count: u16) -> Self {
        Self {
            kind: U16::new(kind as u16),
            count: U16::new(count),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "bad node header: buffer holds {} bytes, header needs {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("bad node header: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "bad node header: buffer holds {} bytes, header needs {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        data[..NODE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::from_tag(self.kind.get())
    }

    pub fn count(&self) -> u16 {
        self.count.get()
    }
}

/// A decoded tree page. Free-list pages are not tree nodes and decode
/// through the storage layer instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Pointer(PointerNode),
}

impl Node {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = NodeHeader::from_bytes(data)?;
        match header.kind()? {
            NodeKind::Leaf => Ok(Node::Leaf(LeafNode::decode(data)?)),
            NodeKind::Pointer => Ok(Node::Pointer(PointerNode::decode(data)?)),
            NodeKind::FreeList => bail!("bad node header: free-list page where a tree node was expected"),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Leaf(_) => NodeKind::Leaf,
            Node::Pointer(_) => NodeKind::Pointer,
        }
    }

    pub fn entry_count(&self) -> usize {
        match self {
            Node::Leaf(n) => n.entry_count(),
            Node::Pointer(n) => n.entry_count(),
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Node::Leaf(n) => n.encoded_size(),
            Node::Pointer(n) => n.encoded_size(),
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        match self {
            Node::Leaf(n) => n.encode_into(buf),
            Node::Pointer(n) => n.encode_into(buf),
        }
    }

    /// Least key held by this node. Errors on an empty node, which never
    /// survives a committed mutation.
    pub fn first_key(&self) -> Result<&[u8]> {
        match self {
            Node::Leaf(n) => n.key_at(0),
            Node::Pointer(n) => n.key_at(0),
        }
    }

    /// Search per node kind. On a leaf, the index is the position of the key
    /// or the insertion point that keeps keys sorted. On a pointer node, the
    /// index addresses the child whose subtree covers the key: the greatest
    /// entry whose separator is <= key, or 0 when the key sorts before every
    /// separator.
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        match self {
            Node::Leaf(n) => n.search(key),
            Node::Pointer(n) => n.search_child(key),
        }
    }

    pub fn split(self) -> Result<(Node, Node)> {
        match self {
            Node::Leaf(n) => {
                let (l, r) = n.split()?;
                Ok((Node::Leaf(l), Node::Leaf(r)))
            }
            Node::Pointer(n) => {
                let (l, r) = n.split()?;
                Ok((Node::Pointer(l), Node::Pointer(r)))
            }
        }
    }

    pub fn merge(self, right: Node) -> Result<Node> {
        match (self, right) {
            (Node::Leaf(l), Node::Leaf(r)) => Ok(Node::Leaf(l.merge(r)?)),
            (Node::Pointer(l), Node::Pointer(r)) => Ok(Node::Pointer(l.merge(r)?)),
            _ => bail!("merge kind: cannot merge a leaf with a pointer node"),
        }
    }
}

/// Binary search over sorted keys, shared by both node kinds. Returns the
/// index of the key or the insertion point that keeps the order.
pub(crate) fn search_keys(keys: &[Vec<u8>], key: &[u8]) -> (usize, bool) {
    match keys.binary_search_by(|probe| probe.as_slice().cmp(key)) {
        Ok(i) => (i, true),
        Err(i) => (i, false),
    }
}

/// Split position for a run of entry sizes: the first index whose cumulative
/// size exceeds half the total, clamped so both halves stay non-empty.
pub(crate) fn split_point(sizes: impl Iterator<Item = usize>, total: usize) -> usize {
    let mut cum = 0usize;
    let mut at = 1usize;
    let mut n = 0usize;

    for (i, size) in sizes.enumerate() {
        n = i + 1;
        cum += size;
        if cum > total / 2 {
            at = i;
            break;
        }
    }

    at.clamp(1, n.saturating_sub(1).max(1))
}

pub(crate) fn read_u16(data: &[u8], off: usize) -> Result<u16> {
    ensure!(
        off + 2 <= data.len(),
        "bad node header: entry extends past the page at offset {}",
        off
    );
    Ok(u16::from_be_bytes([data[off], data[off + 1]]))
}

pub(crate) fn read_u64(data: &[u8], off: usize) -> Result<PageId> {
    ensure!(
        off + 8 <= data.len(),
        "bad node header: entry extends past the page at offset {}",
        off
    );
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    Ok(PageId::from_be_bytes(raw))
}
