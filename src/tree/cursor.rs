//! Ordered iteration over a tree snapshot. The cursor keeps a stack of
//! (node, index) frames from the root down to the current leaf; `next`
//! yields pairs in key order, climbing and descending as frames exhaust.
//! Cursors borrow their page source, so they are pinned to one snapshot.

use eyre::Result;
use smallvec::SmallVec;

use crate::node::Node;
use crate::store::PageId;

use super::PageSource;

/// One descent step: the decoded node and the entry index under iteration.
type Frame = (Node, usize);

pub struct Cursor<'a, S: PageSource> {
    source: &'a S,
    stack: SmallVec<[Frame; 8]>,
}

impl<'a, S: PageSource> Cursor<'a, S> {
    /// Positions the cursor at the first key >= `key`. An empty key seeks
    /// to the start of the tree.
    pub fn seek(source: &'a S, root: PageId, key: &[u8]) -> Result<Self> {
        let mut cursor = Self {
            source,
            stack: SmallVec::new(),
        };

        if root == 0 {
            return Ok(cursor);
        }

        let mut id = root;
        loop {
            let node = source.read_node(id)?;
            match node {
                Node::Pointer(ref ptr) => {
                    let (index, _) = ptr.search_child(key);
                    id = ptr.child_at(index)?;
                    cursor.stack.push((node, index));
                }
                Node::Leaf(ref leaf) => {
                    let (index, _) = leaf.search(key);
                    cursor.stack.push((node, index));
                    return Ok(cursor);
                }
            }
        }
    }

    /// Returns the next pair in key order, or `None` past the last key.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            enum Step {
                Finished,
                Yield(Vec<u8>, Vec<u8>),
                Pop,
                Descend(PageId),
            }

            let step = match self.stack.last_mut() {
                None => Step::Finished,
                Some((Node::Leaf(leaf), index)) => {
                    if *index < leaf.entry_count() {
                        let (key, val) = leaf.pair_at(*index)?;
                        let pair = (key.to_vec(), val.to_vec());
                        *index += 1;
                        Step::Yield(pair.0, pair.1)
                    } else {
                        Step::Pop
                    }
                }
                Some((Node::Pointer(ptr), index)) => {
                    if *index + 1 < ptr.entry_count() {
                        *index += 1;
                        Step::Descend(ptr.child_at(*index)?)
                    } else {
                        Step::Pop
                    }
                }
            };

            match step {
                Step::Finished => return Ok(None),
                Step::Yield(key, val) => return Ok(Some((key, val))),
                Step::Pop => {
                    self.stack.pop();
                }
                Step::Descend(child) => self.descend_first(child)?,
            }
        }
    }

    /// Pushes the leftmost path under `id` onto the stack.
    fn descend_first(&mut self, mut id: PageId) -> Result<()> {
        loop {
            let node = self.source.read_node(id)?;
            match node {
                Node::Pointer(ref ptr) => {
                    id = ptr.child_at(0)?;
                    self.stack.push((node, 0));
                }
                Node::Leaf(_) => {
                    self.stack.push((node, 0));
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MmapStorage, WriteTxn, DEFAULT_SIGNATURE};
    use crate::tree::BTree;
    use parking_lot::RwLock;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn scan_yields_every_key_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = RwLock::new(MmapStorage::create(&path, PAGE_SIZE, 1).unwrap());
        let mut store = WriteTxn::new(&storage, PAGE_SIZE, DEFAULT_SIGNATURE, 0, 1, 0);

        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in (0..200).rev() {
                let key = format!("key{:04}", i);
                tree.set(key.as_bytes(), &[b'v'; 100]).unwrap();
            }
            tree.root()
        };

        let mut cursor = Cursor::seek(&store, root, b"").unwrap();
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }

        assert_eq!(seen.len(), 200);
        for (i, key) in seen.iter().enumerate() {
            assert_eq!(key, format!("key{:04}", i).as_bytes());
        }
    }

    #[test]
    fn seek_starts_from_the_first_key_at_or_after_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = RwLock::new(MmapStorage::create(&path, PAGE_SIZE, 1).unwrap());
        let mut store = WriteTxn::new(&storage, PAGE_SIZE, DEFAULT_SIGNATURE, 0, 1, 0);

        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in 0..100 {
                let key = format!("key{:04}", i * 2);
                tree.set(key.as_bytes(), b"v").unwrap();
            }
            tree.root()
        };

        // Exact hit.
        let mut cursor = Cursor::seek(&store, root, b"key0010").unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().0, b"key0010".to_vec());

        // Absent key resumes at the next greater one.
        let mut cursor = Cursor::seek(&store, root, b"key0011").unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().0, b"key0012".to_vec());

        // Past the end yields nothing.
        let mut cursor = Cursor::seek(&store, root, b"zzz").unwrap();
        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn cursor_on_empty_tree_is_immediately_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = RwLock::new(MmapStorage::create(&path, PAGE_SIZE, 1).unwrap());
        let store = WriteTxn::new(&storage, PAGE_SIZE, DEFAULT_SIGNATURE, 0, 1, 0);

        let mut cursor = Cursor::seek(&store, 0, b"").unwrap();

        assert!(cursor.next().unwrap().is_none());
    }

    #[test]
    fn scan_crosses_leaf_boundaries_in_a_deep_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = RwLock::new(MmapStorage::create(&path, PAGE_SIZE, 1).unwrap());
        let mut store = WriteTxn::new(&storage, PAGE_SIZE, DEFAULT_SIGNATURE, 0, 1, 0);

        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in 0..300 {
                let key = format!("key{:04}", i);
                tree.set(key.as_bytes(), &[b'x'; 400]).unwrap();
            }
            tree.root()
        };

        let mut cursor = Cursor::seek(&store, root, b"").unwrap();
        let mut count = 0;
        let mut last: Option<Vec<u8>> = None;
        while let Some((key, val)) = cursor.next().unwrap() {
            if let Some(prev) = &last {
                assert!(prev < &key, "scan order regressed at {:?}", key);
            }
            assert_eq!(val.len(), 400);
            last = Some(key);
            count += 1;
        }

        assert_eq!(count, 300);
    }
}
