//! Pointer nodes route descent: each entry pairs a separator key with the
//! page id of the child subtree holding every key from that separator up to
//! (but excluding) the next one. The separator always equals the least key
//! stored in its subtree.
//!
//! ```text
//! | key_len (2) | key bytes | child page id (8) | ...
//! ```

use eyre::{ensure, Result};

use super::{
    read_u16, read_u64, search_keys, split_point, NodeHeader, NodeKind, NODE_HEADER_SIZE,
    POINTER_ENTRY_OVERHEAD,
};
use crate::store::PageId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerNode {
    keys: Vec<Vec<u8>>,
    children: Vec<PageId>,
}

impl PointerNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = NodeHeader::from_bytes(data)?;
        ensure!(
            header.kind()? == NodeKind::Pointer,
            "bad node header: expected a pointer node, found {:?}",
            header.kind()?
        );

        let count = header.count() as usize;
        let mut keys = Vec::with_capacity(count);
        let mut children = Vec::with_capacity(count);

        let mut off = NODE_HEADER_SIZE;
        for _ in 0..count {
            let key_len = read_u16(data, off)? as usize;
            off += 2;

            ensure!(
                off + key_len + 8 <= data.len(),
                "bad node header: pointer entry extends past the page at offset {}",
                off
            );

            keys.push(data[off..off + key_len].to_vec());
            off += key_len;
            children.push(read_u64(data, off)?);
            off += 8;
        }

        Ok(Self { keys, children })
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.encoded_size() <= buf.len(),
            "pointer node too large: {} bytes into a {} byte page",
            self.encoded_size(),
            buf.len()
        );
        ensure!(
            self.keys.len() <= u16::MAX as usize,
            "pointer node too large: {} entries exceed the entry-count field",
            self.keys.len()
        );

        NodeHeader::new(NodeKind::Pointer, self.keys.len() as u16).write_to(buf)?;

        let mut off = NODE_HEADER_SIZE;
        for (key, child) in self.keys.iter().zip(&self.children) {
            buf[off..off + 2].copy_from_slice(&(key.len() as u16).to_be_bytes());
            off += 2;
            buf[off..off + key.len()].copy_from_slice(key);
            off += key.len();
            buf[off..off + 8].copy_from_slice(&child.to_be_bytes());
            off += 8;
        }

        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.keys.len()
    }

    pub fn encoded_size(&self) -> usize {
        NODE_HEADER_SIZE + self.body_size()
    }

    fn body_size(&self) -> usize {
        self.keys
            .iter()
            .map(|k| POINTER_ENTRY_OVERHEAD + k.len())
            .sum()
    }

    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        ensure!(
            index < self.keys.len(),
            "pointer index {} out of range (len={})",
            index,
            self.keys.len()
        );
        Ok(&self.keys[index])
    }

    pub fn child_at(&self, index: usize) -> Result<PageId> {
        ensure!(
            index < self.children.len(),
            "pointer index {} out of range (len={})",
            index,
            self.children.len()
        );
        Ok(self.children[index])
    }

    /// Index of the child whose subtree covers `key`: the greatest entry
    /// whose separator is <= key (exact index on equality), or 0 when the
    /// key sorts before every separator.
    pub fn search_child(&self, key: &[u8]) -> (usize, bool) {
        let (index, found) = search_keys(&self.keys, key);
        if found {
            (index, true)
        } else {
            (index.saturating_sub(1), false)
        }
    }

    pub fn insert(mut self, index: usize, key: &[u8], child: PageId) -> Result<Self> {
        ensure!(
            index <= self.keys.len(),
            "pointer index {} out of range (len={})",
            index,
            self.keys.len()
        );

        self.keys.insert(index, key.to_vec());
        self.children.insert(index, child);
        Ok(self)
    }

    /// Replaces the child id at `index`. The stored separator must equal
    /// `key`; installing a changed separator is a delete plus insert.
    pub fn update(mut self, index: usize, key: &[u8], child: PageId) -> Result<Self> {
        ensure!(
            index < self.keys.len(),
            "pointer index {} out of range (len={})",
            index,
            self.keys.len()
        );
        ensure!(
            self.keys[index] == key,
            "pointer update key mismatch at index {}",
            index
        );

        self.children[index] = child;
        Ok(self)
    }

    pub fn delete(mut self, index: usize) -> Result<Self> {
        ensure!(
            index < self.keys.len(),
            "pointer index {} out of range (len={})",
            index,
            self.keys.len()
        );

        self.keys.remove(index);
        self.children.remove(index);
        Ok(self)
    }

    pub fn split(mut self) -> Result<(Self, Self)> {
        ensure!(
            self.keys.len() >= 2,
            "pointer index 1 out of range (len={}): node too small to split",
            self.keys.len()
        );

        let total = self.body_size();
        let at = split_point(
            self.keys.iter().map(|k| POINTER_ENTRY_OVERHEAD + k.len()),
            total,
        );

        let right = Self {
            keys: self.keys.split_off(at),
            children: self.children.split_off(at),
        };

        Ok((self, right))
    }

    pub fn merge(mut self, right: Self) -> Result<Self> {
        if let (Some(last), Some(first)) = (self.keys.last(), right.keys.first()) {
            ensure!(
                last.as_slice() < first.as_slice(),
                "merge out of order: left last key >= right first key"
            );
        }

        if right.keys.is_empty() {
            return Ok(self);
        }
        if self.keys.is_empty() {
            return Ok(right);
        }

        self.keys.extend(right.keys);
        self.children.extend(right.children);
        Ok(self)
    }
}

impl FromIterator<(Vec<u8>, PageId)> for PointerNode {
    fn from_iter<T: IntoIterator<Item = (Vec<u8>, PageId)>>(iter: T) -> Self {
        let (keys, children) = iter.into_iter().unzip();
        Self { keys, children }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer(entries: &[(&[u8], PageId)]) -> PointerNode {
        entries.iter().map(|(k, c)| (k.to_vec(), *c)).collect()
    }

    #[test]
    fn pointer_encode_decode_round_trip() {
        let node = pointer(&[(b"a", 3), (b"m", 9), (b"t", 12)]);
        let mut page = vec![0u8; 4096];

        node.encode_into(&mut page).unwrap();
        let back = PointerNode::decode(&page).unwrap();

        assert_eq!(back, node);
    }

    #[test]
    fn pointer_encoded_size_matches_layout() {
        let node = pointer(&[(b"ab", 1), (b"cdef", 2)]);

        assert_eq!(
            node.encoded_size(),
            NODE_HEADER_SIZE + (POINTER_ENTRY_OVERHEAD + 2) + (POINTER_ENTRY_OVERHEAD + 4)
        );
    }

    #[test]
    fn pointer_search_child_routes_between_separators() {
        let node = pointer(&[(b"b", 1), (b"h", 2), (b"p", 3)]);

        // Before every separator: leftmost child.
        assert_eq!(node.search_child(b"a"), (0, false));
        // Exact separator hit returns that index.
        assert_eq!(node.search_child(b"h"), (1, true));
        // Between separators: greatest separator <= key.
        assert_eq!(node.search_child(b"k"), (1, false));
        // Past the last separator: rightmost child.
        assert_eq!(node.search_child(b"z"), (2, false));
    }

    #[test]
    fn pointer_search_child_single_entry_returns_zero() {
        let node = pointer(&[(b"m", 7)]);

        assert_eq!(node.search_child(b"a"), (0, false));
        assert_eq!(node.search_child(b"m"), (0, true));
        assert_eq!(node.search_child(b"z"), (0, false));
    }

    #[test]
    fn pointer_update_rejects_key_mismatch() {
        let node = pointer(&[(b"a", 1)]);

        let result = node.update(0, b"b", 2);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("key mismatch"));
    }

    #[test]
    fn pointer_update_replaces_child() {
        let node = pointer(&[(b"a", 1), (b"m", 2)]);

        let node = node.update(1, b"m", 42).unwrap();

        assert_eq!(node.child_at(1).unwrap(), 42);
    }

    #[test]
    fn pointer_split_then_merge_restores_entries() {
        let node: PointerNode = (0..16)
            .map(|i| (format!("key{:02}", i).into_bytes(), i as PageId + 1))
            .collect();
        let original = node.clone();

        let (left, right) = node.split().unwrap();
        let merged = left.merge(right).unwrap();

        assert_eq!(merged, original);
    }

    #[test]
    fn pointer_merge_rejects_mixed_kind_through_node() {
        use crate::node::{LeafNode, Node};

        let left = Node::Pointer(pointer(&[(b"a", 1)]));
        let right = Node::Leaf(LeafNode::new().insert(0, b"z", b"1").unwrap());

        let result = left.merge(right);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("merge kind"));
    }
}
