//! # Copy-on-Write B+Tree
//!
//! The ordered map over the page store. All data lives in leaf nodes;
//! pointer nodes route descent by separator keys, where a separator always
//! equals the least key of its child subtree.
//!
//! ## Mutation protocol
//!
//! Every mutation is copy-on-write: descent reads a node, schedules its page
//! for release, and rebuilds a replacement bottom-up. The recursion returns
//! the rebuilt child as a value; the parent allocates it, installs the new
//! child id (refreshing the separator if the child's least key moved), and
//! is itself returned upward. Only fully-built nodes are ever allocated, so
//! an aborted transaction leaves no trace.
//!
//! ## Split and merge
//!
//! A rebuilt node larger than a page splits at the first entry whose
//! cumulative size crosses half the node; the parent gains the right half's
//! least key as a new separator. A root split adds a level. On delete, a
//! rebuilt child smaller than a quarter page merges with its right sibling
//! when the pair fits in one page, else its left; an under-filled node with
//! no mergeable sibling is tolerated. A pointer root left with one child
//! collapses, and a tree whose last key is deleted becomes empty (root 0).
//!
//! The seams to the storage layer are the [`PageSource`] and [`PageStore`]
//! traits: snapshots implement the former, write transactions both.

pub mod cursor;

pub use cursor::Cursor;

use eyre::Result;

use crate::node::{LeafNode, Node, PointerNode, NODE_HEADER_SIZE};
use crate::store::PageId;

/// Read access to decoded pages. Implemented by reader snapshots and write
/// transactions.
pub trait PageSource {
    fn read_node(&self, id: PageId) -> Result<Node>;
}

/// Write access on top of [`PageSource`]: placing new nodes and releasing
/// replaced pages. Implemented by write transactions.
pub trait PageStore: PageSource {
    fn alloc_node(&mut self, node: &Node) -> Result<PageId>;
    fn free_page(&mut self, id: PageId);
}

/// Point lookup against a tree rooted at `root` (0 means the empty tree).
pub fn get<S: PageSource>(source: &S, root: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    if root == 0 {
        return Ok(None);
    }

    let mut id = root;
    loop {
        match source.read_node(id)? {
            Node::Leaf(leaf) => {
                let (index, found) = leaf.search(key);
                return if found {
                    Ok(Some(leaf.val_at(index)?.to_vec()))
                } else {
                    Ok(None)
                };
            }
            Node::Pointer(ptr) => {
                let (index, _) = ptr.search_child(key);
                id = ptr.child_at(index)?;
            }
        }
    }
}

pub struct BTree<'a, S: PageStore> {
    store: &'a mut S,
    root: PageId,
    page_size: usize,
}

impl<'a, S: PageStore> BTree<'a, S> {
    pub fn new(store: &'a mut S, root: PageId, page_size: usize) -> Self {
        Self {
            store,
            root,
            page_size,
        }
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        get(&*self.store, self.root, key)
    }

    /// Inserts the pair, replacing the value when the key is present.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        if self.root == 0 {
            let leaf = LeafNode::new().insert(0, key, val)?;
            self.root = self.store.alloc_node(&Node::Leaf(leaf))?;
            return Ok(());
        }

        let rebuilt = self.set_rec(self.root, key, val)?;

        self.root = if rebuilt.encoded_size() > self.page_size {
            let (left, right) = rebuilt.split()?;
            let left_key = left.first_key()?.to_vec();
            let right_key = right.first_key()?.to_vec();
            let left_id = self.store.alloc_node(&left)?;
            let right_id = self.store.alloc_node(&right)?;

            let new_root = PointerNode::new()
                .insert(0, &left_key, left_id)?
                .insert(1, &right_key, right_id)?;
            self.store.alloc_node(&Node::Pointer(new_root))?
        } else {
            self.store.alloc_node(&rebuilt)?
        };

        Ok(())
    }

    fn set_rec(&mut self, id: PageId, key: &[u8], val: &[u8]) -> Result<Node> {
        let node = self.store.read_node(id)?;
        self.store.free_page(id);

        match node {
            Node::Leaf(leaf) => {
                let (index, found) = leaf.search(key);
                let leaf = if found {
                    leaf.update(index, key, val)?
                } else {
                    leaf.insert(index, key, val)?
                };
                Ok(Node::Leaf(leaf))
            }
            Node::Pointer(ptr) => {
                let (index, _) = ptr.search_child(key);
                let child_id = ptr.child_at(index)?;
                let rebuilt = self.set_rec(child_id, key, val)?;
                Ok(Node::Pointer(self.install_child(ptr, index, rebuilt)?))
            }
        }
    }

    /// Installs a rebuilt child at entry `index`, splitting it first when it
    /// outgrew the page.
    fn install_child(
        &mut self,
        parent: PointerNode,
        index: usize,
        child: Node,
    ) -> Result<PointerNode> {
        if child.encoded_size() > self.page_size {
            let (left, right) = child.split()?;
            let left_key = left.first_key()?.to_vec();
            let right_key = right.first_key()?.to_vec();
            let left_id = self.store.alloc_node(&left)?;
            let right_id = self.store.alloc_node(&right)?;

            let parent = self.reseat(parent, index, &left_key, left_id)?;
            Ok(parent.insert(index + 1, &right_key, right_id)?)
        } else {
            self.install(parent, index, child)
        }
    }

    /// Allocates the child and points entry `index` at it.
    fn install(&mut self, parent: PointerNode, index: usize, child: Node) -> Result<PointerNode> {
        let child_key = child.first_key()?.to_vec();
        let child_id = self.store.alloc_node(&child)?;
        self.reseat(parent, index, &child_key, child_id)
    }

    /// Re-points entry `index` at `child_id`, replacing the separator when
    /// the child's least key moved.
    fn reseat(
        &mut self,
        parent: PointerNode,
        index: usize,
        key: &[u8],
        child_id: PageId,
    ) -> Result<PointerNode> {
        if parent.key_at(index)? == key {
            parent.update(index, key, child_id)
        } else {
            parent.delete(index)?.insert(index, key, child_id)
        }
    }

    /// Removes the key. Returns false (leaving the tree untouched) when it
    /// is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.root == 0 {
            return Ok(false);
        }

        let Some(rebuilt) = self.delete_rec(self.root, key)? else {
            return Ok(false);
        };

        self.root = match rebuilt {
            Node::Leaf(leaf) if leaf.entry_count() == 0 => 0,
            Node::Pointer(ptr) if ptr.entry_count() == 0 => 0,
            // A root holding a single child is one level too tall.
            Node::Pointer(ptr) if ptr.entry_count() == 1 => ptr.child_at(0)?,
            other => self.store.alloc_node(&other)?,
        };

        Ok(true)
    }

    fn delete_rec(&mut self, id: PageId, key: &[u8]) -> Result<Option<Node>> {
        let node = self.store.read_node(id)?;

        match node {
            Node::Leaf(leaf) => {
                let (index, found) = leaf.search(key);
                if !found {
                    return Ok(None);
                }
                self.store.free_page(id);
                Ok(Some(Node::Leaf(leaf.delete(index)?)))
            }
            Node::Pointer(ptr) => {
                let (index, _) = ptr.search_child(key);
                let child_id = ptr.child_at(index)?;

                let Some(rebuilt) = self.delete_rec(child_id, key)? else {
                    return Ok(None);
                };

                self.store.free_page(id);
                Ok(Some(Node::Pointer(self.rebalance(ptr, index, rebuilt)?)))
            }
        }
    }

    /// Reinstalls a shrunken child, merging it into a sibling when it fell
    /// under a quarter page: right sibling first, then left, else it stays
    /// under-filled.
    fn rebalance(
        &mut self,
        parent: PointerNode,
        index: usize,
        child: Node,
    ) -> Result<PointerNode> {
        if child.entry_count() == 0 {
            // The subtree emptied out entirely; drop its entry.
            return parent.delete(index);
        }

        if child.encoded_size() >= self.page_size / 4 {
            return self.install(parent, index, child);
        }

        if index + 1 < parent.entry_count() {
            let right_id = parent.child_at(index + 1)?;
            let right = self.store.read_node(right_id)?;
            if merged_size(&child, &right) <= self.page_size {
                self.store.free_page(right_id);
                let merged = child.merge(right)?;
                let parent = parent.delete(index + 1)?;
                return self.install(parent, index, merged);
            }
        }

        if index > 0 {
            let left_id = parent.child_at(index - 1)?;
            let left = self.store.read_node(left_id)?;
            if merged_size(&left, &child) <= self.page_size {
                self.store.free_page(left_id);
                let merged = left.merge(child)?;
                let parent = parent.delete(index)?;
                return self.install(parent, index - 1, merged);
            }
        }

        self.install(parent, index, child)
    }
}

fn merged_size(left: &Node, right: &Node) -> usize {
    left.encoded_size() + right.encoded_size() - NODE_HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MmapStorage, WriteTxn, DEFAULT_SIGNATURE};
    use parking_lot::RwLock;
    use std::collections::BTreeMap;

    const PAGE_SIZE: usize = 4096;

    fn txn_fixture() -> (tempfile::TempDir, RwLock<MmapStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = MmapStorage::create(&path, PAGE_SIZE, 1).unwrap();
        (dir, RwLock::new(storage))
    }

    fn txn(storage: &RwLock<MmapStorage>) -> WriteTxn<'_> {
        WriteTxn::new(storage, PAGE_SIZE, DEFAULT_SIGNATURE, 0, 1, 0)
    }

    #[test]
    fn get_on_empty_tree_returns_none() {
        let (_dir, storage) = txn_fixture();
        let store = txn(&storage);

        assert_eq!(get(&store, 0, b"missing").unwrap(), None);
    }

    #[test]
    fn set_into_empty_tree_creates_single_leaf_root() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);
        let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);

        tree.set(b"a", b"1").unwrap();

        assert_ne!(tree.root(), 0);
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), None);
    }

    #[test]
    fn set_replaces_value_for_present_key() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);
        let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);

        tree.set(b"k", b"old").unwrap();
        tree.set(b"k", b"new").unwrap();

        assert_eq!(tree.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn delete_missing_key_returns_false() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);
        let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);

        assert!(!tree.delete(b"ghost").unwrap());

        tree.set(b"a", b"1").unwrap();
        assert!(!tree.delete(b"ghost").unwrap());
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn deleting_the_last_key_empties_the_tree() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);
        let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);

        tree.set(b"only", b"1").unwrap();
        assert!(tree.delete(b"only").unwrap());

        assert_eq!(tree.root(), 0);
        assert_eq!(tree.get(b"only").unwrap(), None);
    }

    #[test]
    fn inserts_split_the_root_and_stay_readable() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);

        // Values of 1000 bytes force a root split within a handful of keys.
        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in 0..8 {
                let key = format!("k{:02}", i);
                tree.set(key.as_bytes(), &[i as u8; 1000]).unwrap();
            }
            tree.root()
        };

        for i in 0..8 {
            let key = format!("k{:02}", i);
            assert_eq!(
                get(&store, root, key.as_bytes()).unwrap(),
                Some(vec![i as u8; 1000])
            );
        }

        assert!(matches!(store.read_node(root).unwrap(), Node::Pointer(_)));
    }

    #[test]
    fn separators_track_least_keys_after_small_key_insert() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);

        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in 0..8 {
                let key = format!("m{:02}", i);
                tree.set(key.as_bytes(), &[0u8; 1000]).unwrap();
            }
            // Sorts before every existing key, landing in the leftmost leaf.
            tree.set(b"a", b"tiny").unwrap();
            tree.root()
        };

        assert_eq!(get(&store, root, b"a").unwrap(), Some(b"tiny".to_vec()));

        match store.read_node(root).unwrap() {
            Node::Pointer(ptr) => {
                assert_eq!(ptr.key_at(0).unwrap(), b"a");
                let child = store.read_node(ptr.child_at(0).unwrap()).unwrap();
                assert_eq!(child.first_key().unwrap(), b"a");
            }
            Node::Leaf(_) => panic!("expected a pointer root after splits"),
        }
    }

    #[test]
    fn deletes_merge_children_back_together() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);

        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            for i in 0..8 {
                let key = format!("k{:02}", i);
                tree.set(key.as_bytes(), &[0u8; 1000]).unwrap();
            }
            for i in 0..7 {
                let key = format!("k{:02}", i);
                assert!(tree.delete(key.as_bytes()).unwrap());
            }
            tree.root()
        };

        // A single key remains; collapse should have brought the root back
        // down to a leaf.
        assert_eq!(get(&store, root, b"k07").unwrap(), Some(vec![0u8; 1000]));
        assert!(matches!(store.read_node(root).unwrap(), Node::Leaf(_)));
    }

    #[test]
    fn tree_matches_btreemap_oracle_through_mixed_operations() {
        let (_dir, storage) = txn_fixture();
        let mut store = txn(&storage);
        let mut oracle: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

        // Deterministic pseudo-random walk over a small key space so that
        // inserts, updates and deletes all occur, with splits and merges.
        let root = {
            let mut tree = BTree::new(&mut store, 0, PAGE_SIZE);
            let mut state = 0x2545f4914f6cdd1du64;
            for _ in 0..4000 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;

                let key = format!("key{:03}", state % 500).into_bytes();
                if state % 4 == 0 {
                    let deleted = tree.delete(&key).unwrap();
                    assert_eq!(deleted, oracle.remove(&key).is_some());
                } else {
                    let val = format!("val{}", state % 9973).into_bytes();
                    tree.set(&key, &val).unwrap();
                    oracle.insert(key, val);
                }
            }
            tree.root()
        };

        for (key, val) in &oracle {
            assert_eq!(get(&store, root, key).unwrap().as_ref(), Some(val));
        }

        let mut cursor = Cursor::seek(&store, root, b"").unwrap();
        let mut scanned = Vec::new();
        while let Some(pair) = cursor.next().unwrap() {
            scanned.push(pair);
        }
        let expected: Vec<_> = oracle
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(scanned, expected);
    }
}
