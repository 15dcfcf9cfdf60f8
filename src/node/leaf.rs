//! Leaf nodes hold the key-value pairs themselves. Entries are packed
//! back-to-back after the node header, each prefixed with two big-endian
//! 16-bit lengths:
//!
//! ```text
//! | key_len (2) | val_len (2) | key bytes | value bytes | ...
//! ```
//!
//! Every operation takes the node by value and returns a fresh node; encoded
//! pages are never edited once written.

use eyre::{ensure, Result};

use super::{
    read_u16, search_keys, split_point, NodeHeader, NodeKind, LEAF_ENTRY_OVERHEAD,
    NODE_HEADER_SIZE,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    keys: Vec<Vec<u8>>,
    vals: Vec<Vec<u8>>,
}

impl LeafNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = NodeHeader::from_bytes(data)?;
        ensure!(
            header.kind()? == NodeKind::Leaf,
            "bad node header: expected a leaf, found {:?}",
            header.kind()?
        );

        let count = header.count() as usize;
        let mut keys = Vec::with_capacity(count);
        let mut vals = Vec::with_capacity(count);

        let mut off = NODE_HEADER_SIZE;
        for _ in 0..count {
            let key_len = read_u16(data, off)? as usize;
            let val_len = read_u16(data, off + 2)? as usize;
            off += LEAF_ENTRY_OVERHEAD;

            ensure!(
                off + key_len + val_len <= data.len(),
                "bad node header: leaf entry extends past the page at offset {}",
                off
            );

            keys.push(data[off..off + key_len].to_vec());
            off += key_len;
            vals.push(data[off..off + val_len].to_vec());
            off += val_len;
        }

        Ok(Self { keys, vals })
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.encoded_size() <= buf.len(),
            "leaf node too large: {} bytes into a {} byte page",
            self.encoded_size(),
            buf.len()
        );
        ensure!(
            self.keys.len() <= u16::MAX as usize,
            "leaf node too large: {} entries exceed the entry-count field",
            self.keys.len()
        );

        NodeHeader::new(NodeKind::Leaf, self.keys.len() as u16).write_to(buf)?;

        let mut off = NODE_HEADER_SIZE;
        for (key, val) in self.keys.iter().zip(&self.vals) {
            buf[off..off + 2].copy_from_slice(&(key.len() as u16).to_be_bytes());
            buf[off + 2..off + 4].copy_from_slice(&(val.len() as u16).to_be_bytes());
            off += LEAF_ENTRY_OVERHEAD;
            buf[off..off + key.len()].copy_from_slice(key);
            off += key.len();
            buf[off..off + val.len()].copy_from_slice(val);
            off += val.len();
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
            .zip(&self.vals)
            .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len())
            .sum()
    }

    pub fn key_at(&self, index: usize) -> Result<&[u8]> {
        ensure!(
            index < self.keys.len(),
            "leaf index {} out of range (len={})",
            index,
            self.keys.len()
        );
        Ok(&self.keys[index])
    }

    pub fn val_at(&self, index: usize) -> Result<&[u8]> {
        ensure!(
            index < self.vals.len(),
            "leaf index {} out of range (len={})",
            index,
            self.vals.len()
        );
        Ok(&self.vals[index])
    }

    pub fn pair_at(&self, index: usize) -> Result<(&[u8], &[u8])> {
        Ok((self.key_at(index)?, self.val_at(index)?))
    }

    /// Binary search. `found` is true when the key is present at the returned
    /// index; otherwise the index is where the key would be inserted.
    pub fn search(&self, key: &[u8]) -> (usize, bool) {
        search_keys(&self.keys, key)
    }

    pub fn insert(mut self, index: usize, key: &[u8], val: &[u8]) -> Result<Self> {
        ensure!(
            index <= self.keys.len(),
            "leaf index {} out of range (len={})",
            index,
            self.keys.len()
        );

        self.keys.insert(index, key.to_vec());
        self.vals.insert(index, val.to_vec());
        Ok(self)
    }

    /// Replaces the value at `index`. The stored key must equal `key`.
    pub fn update(mut self, index: usize, key: &[u8], val: &[u8]) -> Result<Self> {
        ensure!(
            index < self.keys.len(),
            "leaf index {} out of range (len={})",
            index,
            self.keys.len()
        );
        ensure!(
            self.keys[index] == key,
            "leaf update key mismatch at index {}",
            index
        );

        self.vals[index] = val.to_vec();
        Ok(self)
    }

    pub fn delete(mut self, index: usize) -> Result<Self> {
        ensure!(
            index < self.keys.len(),
            "leaf index {} out of range (len={})",
            index,
            self.keys.len()
        );

        self.keys.remove(index);
        self.vals.remove(index);
        Ok(self)
    }

    /// Splits at the first entry whose cumulative size exceeds half the
    /// node's body. Both halves keep the original entry order.
    pub fn split(mut self) -> Result<(Self, Self)> {
        ensure!(
            self.keys.len() >= 2,
            "leaf index 1 out of range (len={}): node too small to split",
            self.keys.len()
        );

        let total = self.body_size();
        let at = split_point(
            self.keys
                .iter()
                .zip(&self.vals)
                .map(|(k, v)| LEAF_ENTRY_OVERHEAD + k.len() + v.len()),
            total,
        );

        let right = Self {
            keys: self.keys.split_off(at),
            vals: self.vals.split_off(at),
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
        self.vals.extend(right.vals);
        Ok(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.keys
            .iter()
            .zip(&self.vals)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

impl FromIterator<(Vec<u8>, Vec<u8>)> for LeafNode {
    fn from_iter<T: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(iter: T) -> Self {
        let (keys, vals) = iter.into_iter().unzip();
        Self { keys, vals }
    }
}
