//! # Persistent Free-List
//!
//! Freed pages are remembered in a singly-linked chain of free-list nodes,
//! each occupying one page. The chain head id lives in the master page.
//!
//! ## Node layout
//!
//! ```text
//! | kind = 3 (2) | count (2) | forward link (8) | count * page id (8) |
//! ```
//!
//! A node holds up to `(page_size - 12) / 8` ids. `push` fills the head
//! node, starting a new head (linked to the old one) when it is absent or
//! full. `pop` walks to the terminal node, takes its last id, and unlinks
//! the node once it empties, so reuse drains the oldest frees first.
//!
//! ## Copy-on-write discipline
//!
//! Chain nodes are pages like any other: a committed node is never edited.
//! Rewrites edit nodes the current transaction created (still private to
//! its overlay) in place; a committed node is replaced by a copy housed in
//! one of its own free ids (falling back to appending a page when it has
//! none to spare), and its old page joins the frees being tracked.
//! Replacing a node changes its id, so a rewrite walks back toward the
//! head until the links stop changing. Ids released by the running
//! transaction are spliced in at commit and are never returned by `pop`
//! in the same transaction.

use eyre::{ensure, Result};

use crate::node::{read_u64, NodeHeader, NodeKind, NODE_HEADER_SIZE};

use super::pager::WriteTxn;
use super::PageId;

/// Bytes before the id array: node header plus the forward link.
pub const FREELIST_HEADER_SIZE: usize = NODE_HEADER_SIZE + 8;

/// Ids one free-list node can hold at the given page size.
pub fn freelist_capacity(page_size: usize) -> usize {
    (page_size - FREELIST_HEADER_SIZE) / 8
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeListNode {
    pub next: PageId,
    pub ids: Vec<PageId>,
}

impl FreeListNode {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = NodeHeader::from_bytes(data)?;
        ensure!(
            header.kind()? == NodeKind::FreeList,
            "bad node header: expected a free-list node, found {:?}",
            header.kind()?
        );

        let count = header.count() as usize;
        let next = read_u64(data, NODE_HEADER_SIZE)?;

        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(read_u64(data, FREELIST_HEADER_SIZE + i * 8)?);
        }

        Ok(Self { next, ids })
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        ensure!(
            self.encoded_size() <= buf.len(),
            "free-list node too large: {} bytes into a {} byte page",
            self.encoded_size(),
            buf.len()
        );

        NodeHeader::new(NodeKind::FreeList, self.ids.len() as u16).write_to(buf)?;
        buf[NODE_HEADER_SIZE..FREELIST_HEADER_SIZE].copy_from_slice(&self.next.to_be_bytes());

        for (i, id) in self.ids.iter().enumerate() {
            let off = FREELIST_HEADER_SIZE + i * 8;
            buf[off..off + 8].copy_from_slice(&id.to_be_bytes());
        }

        Ok(())
    }

    pub fn encoded_size(&self) -> usize {
        FREELIST_HEADER_SIZE + self.ids.len() * 8
    }
}

impl WriteTxn<'_> {
    pub(crate) fn read_freelist(&self, id: PageId) -> Result<FreeListNode> {
        self.with_page(id, FreeListNode::decode)
    }

    fn encode_freelist(&self, node: &FreeListNode) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        node.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Rewrites one chain node, in place when this transaction owns it,
    /// otherwise as a copy-on-write replacement. The replacement is housed
    /// in one of the node's own free ids whenever it can spare one, so
    /// chain maintenance does not grow the file in steady state; the
    /// replaced page is scheduled for release. Returns the id the node now
    /// lives at.
    fn rewrite_freelist(&mut self, id: PageId, node: &FreeListNode) -> Result<PageId> {
        if self.fresh.contains(&id) {
            let bytes = self.encode_freelist(node)?;
            self.overlay.insert(id, bytes);
            return Ok(id);
        }

        self.release_page(id);

        let mut node = node.clone();
        let housed = if node.ids.len() >= 2 { node.ids.pop() } else { None };
        let new_id = match housed {
            Some(free_id) => free_id,
            None => self.next_append(),
        };

        let bytes = self.encode_freelist(&node)?;
        self.overlay.insert(new_id, bytes);
        self.fresh.insert(new_id);
        Ok(new_id)
    }

    fn load_chain(&self) -> Result<Vec<(PageId, FreeListNode)>> {
        let mut chain = Vec::new();
        let mut cur = self.fl_head;

        while cur != 0 {
            ensure!(
                chain.len() as u64 <= self.page_count(),
                "bad node header: free-list chain does not terminate"
            );
            let node = self.read_freelist(cur)?;
            let next = node.next;
            chain.push((cur, node));
            cur = next;
        }

        Ok(chain)
    }

    /// Writes the chain back, head last, refreshing forward links wherever
    /// a node moved. Nodes at or past `dirty_from` changed content and are
    /// always rewritten; the cascade stops as soon as ids stop changing.
    fn write_chain(&mut self, chain: Vec<(PageId, FreeListNode)>, dirty_from: usize) -> Result<()> {
        let mut child: PageId = 0;

        for (i, (id, mut node)) in chain.into_iter().enumerate().rev() {
            if i >= dirty_from || node.next != child {
                node.next = child;
                child = self.rewrite_freelist(id, &node)?;
            } else {
                child = id;
            }
        }

        self.fl_head = child;
        Ok(())
    }

    /// Takes one reusable page id from the terminal node of the chain, or
    /// returns `None` when the chain is empty.
    pub(crate) fn free_pop(&mut self) -> Result<Option<PageId>> {
        if self.fl_head == 0 {
            return Ok(None);
        }

        let mut chain = self.load_chain()?;
        let mut popped = None;
        let mut terminal_modified = false;

        while popped.is_none() {
            let Some((id, node)) = chain.last_mut() else {
                break;
            };

            popped = node.ids.pop();
            if node.ids.is_empty() {
                let id = *id;
                chain.pop();
                self.release_page(id);
                terminal_modified = false;
            } else {
                terminal_modified = popped.is_some();
            }
        }

        let dirty_from = if terminal_modified {
            chain.len() - 1
        } else {
            chain.len()
        };
        self.write_chain(chain, dirty_from)?;

        Ok(popped)
    }

    /// Splices a batch of freed page ids into the chain. Replacing a full or
    /// committed head frees that head's old page too, so the worklist drains
    /// everything the splice itself produces.
    pub(crate) fn free_push_all(&mut self, ids: Vec<PageId>) -> Result<()> {
        let mut work = ids;
        while let Some(id) = work.pop() {
            self.free_push_one(id, &mut work)?;
        }
        Ok(())
    }

    fn free_push_one(&mut self, id: PageId, work: &mut Vec<PageId>) -> Result<()> {
        let capacity = freelist_capacity(self.page_size);

        if self.fl_head == 0 {
            let node = FreeListNode { next: 0, ids: vec![id] };
            let bytes = self.encode_freelist(&node)?;
            self.fl_head = self.append_bytes(bytes);
            return Ok(());
        }

        let head = self.read_freelist(self.fl_head)?;

        if head.ids.len() >= capacity {
            let node = FreeListNode {
                next: self.fl_head,
                ids: vec![id],
            };
            let bytes = self.encode_freelist(&node)?;
            self.fl_head = self.append_bytes(bytes);
            return Ok(());
        }

        let mut node = head;
        node.ids.push(id);

        if self.fresh.contains(&self.fl_head) {
            let bytes = self.encode_freelist(&node)?;
            self.overlay.insert(self.fl_head, bytes);
            return Ok(());
        }

        // The head is committed: replace it copy-on-write, housing the
        // replacement in one of its ids when possible. The replaced page is
        // itself free and joins the batch being spliced.
        let old_head = self.fl_head;
        let housed = if node.ids.len() >= 2 { node.ids.pop() } else { None };
        let new_id = match housed {
            Some(free_id) => free_id,
            None => self.next_append(),
        };

        let bytes = self.encode_freelist(&node)?;
        self.overlay.insert(new_id, bytes);
        self.fresh.insert(new_id);
        self.fl_head = new_id;
        work.push(old_head);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CommitFault, MmapStorage, WriteTxn, DEFAULT_SIGNATURE};
    use parking_lot::RwLock;

    fn txn_fixture(pages: u64) -> (tempfile::TempDir, RwLock<MmapStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = MmapStorage::create(&path, 4096, pages).unwrap();
        (dir, RwLock::new(storage))
    }

    #[test]
    fn freelist_node_round_trip() {
        let node = FreeListNode {
            next: 9,
            ids: vec![4, 8, 15, 16, 23, 42],
        };
        let mut page = vec![0u8; 4096];

        node.encode_into(&mut page).unwrap();
        let back = FreeListNode::decode(&page).unwrap();

        assert_eq!(back, node);
    }

    #[test]
    fn freelist_node_layout_is_big_endian() {
        let node = FreeListNode { next: 1, ids: vec![2] };
        let mut page = vec![0u8; 64];

        node.encode_into(&mut page).unwrap();

        assert_eq!(&page[..4], &[0, 3, 0, 1]);
        assert_eq!(&page[4..12], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&page[12..20], &[0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn freelist_capacity_matches_layout() {
        assert_eq!(freelist_capacity(4096), (4096 - 12) / 8);
    }

    #[test]
    fn pop_on_empty_chain_returns_none() {
        let (_dir, storage) = txn_fixture(1);
        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);

        assert_eq!(txn.free_pop().unwrap(), None);
    }

    #[test]
    fn push_then_pop_within_a_transaction() {
        let (_dir, storage) = txn_fixture(1);
        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);

        txn.free_push_all(vec![11, 12, 13]).unwrap();

        assert_eq!(txn.free_pop().unwrap(), Some(11));
        assert_eq!(txn.free_pop().unwrap(), Some(12));
        assert_eq!(txn.free_pop().unwrap(), Some(13));
        assert_eq!(txn.free_pop().unwrap(), None);
        assert_eq!(txn.fl_head, 0);
    }

    #[test]
    fn chain_survives_commit_and_reload() {
        let (_dir, storage) = txn_fixture(1);

        let fl_head;
        let page_count;
        {
            let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);
            txn.free_push_all(vec![21, 22]).unwrap();
            let state = txn.commit(0, CommitFault::None).unwrap();
            fl_head = state.freelist_head;
            page_count = state.page_count;
        }

        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, fl_head, page_count, 1);
        assert_eq!(txn.free_pop().unwrap(), Some(21));
        assert_eq!(txn.free_pop().unwrap(), Some(22));
        assert_eq!(txn.free_pop().unwrap(), None);
    }

    #[test]
    fn popping_a_committed_chain_rewrites_it_copy_on_write() {
        let (_dir, storage) = txn_fixture(1);

        let fl_head;
        let page_count;
        {
            let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);
            txn.free_push_all(vec![31, 32, 33]).unwrap();
            let state = txn.commit(0, CommitFault::None).unwrap();
            fl_head = state.freelist_head;
            page_count = state.page_count;
        }

        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, fl_head, page_count, 1);
        let popped = txn.free_pop().unwrap();

        assert_eq!(popped, Some(31));
        // The committed head page was not edited; the replacement was
        // housed in one of the node's own free ids and the old page is
        // scheduled for release.
        assert_ne!(txn.fl_head, fl_head);
        assert_eq!(txn.fl_head, 32);
        assert!(txn.released.contains(&fl_head));
        let node = txn.read_freelist(txn.fl_head).unwrap();
        assert_eq!(node.ids, vec![33]);
    }

    #[test]
    fn push_spills_into_a_new_head_when_full() {
        let (_dir, storage) = txn_fixture(1);
        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);

        let capacity = freelist_capacity(4096) as u64;
        let ids: Vec<PageId> = (1000..1000 + capacity + 5).collect();
        txn.free_push_all(ids).unwrap();

        let head = txn.read_freelist(txn.fl_head).unwrap();
        assert!(head.next != 0);
        let tail = txn.read_freelist(head.next).unwrap();
        assert_eq!(tail.ids.len(), capacity as usize);
        assert_eq!(head.ids.len() + tail.ids.len(), capacity as usize + 5);
    }

    #[test]
    fn pop_drains_across_node_boundaries() {
        let (_dir, storage) = txn_fixture(1);
        let mut txn = WriteTxn::new(&storage, 4096, DEFAULT_SIGNATURE, 0, 1, 0);

        let capacity = freelist_capacity(4096) as u64;
        let total = capacity + 3;
        txn.free_push_all((5000..5000 + total).collect()).unwrap();

        let mut drained = Vec::new();
        while let Some(id) = txn.free_pop().unwrap() {
            drained.push(id);
        }

        assert_eq!(drained.len(), total as usize);
        let mut sorted = drained.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), total as usize);
        assert_eq!(txn.fl_head, 0);
    }
}
