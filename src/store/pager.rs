//! # Write Transaction Page Store
//!
//! `WriteTxn` is the page store a writer sees. It layers a private overlay
//! (page id → replacement bytes) over the committed file:
//!
//! - `with_page` consults the overlay first and falls through to the mapping;
//! - `alloc` serializes a node into a page sized buffer and picks an id from
//!   the transaction's recycled pages, then the persistent free-list, then
//!   by appending past the committed page count;
//! - `free` records a committed page for release at commit, or returns a
//!   page allocated by this very transaction straight to the recycle pile.
//!
//! ## Commit
//!
//! Commit is the only place the file changes:
//!
//! 1. grow the file (geometrically) to cover every appended page,
//! 2. copy all overlay pages to their slots and sync,
//! 3. write the 48-byte master page referencing the new root, free-list
//!    head, page count and sequence, and sync again.
//!
//! The master write is the linearization point. `CommitFault` lets tests
//! stop the protocol between the two syncs to exercise crash recovery.

use eyre::{ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::debug;

use crate::node::Node;
use crate::tree::{PageSource, PageStore};

use super::{grow_target, MasterPage, MmapStorage, PageId, MASTER_SIZE, SIGNATURE_SIZE};

/// Injection point for simulated crashes in tests. `BeforeMasterWrite`
/// makes commit stop after the data sync, leaving the old master in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitFault {
    None,
    BeforeMasterWrite,
}

/// The committed state a successful commit publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitState {
    pub root: PageId,
    pub freelist_head: PageId,
    pub page_count: u64,
    pub commit_seq: u64,
}

pub struct WriteTxn<'a> {
    pub(crate) storage: &'a RwLock<MmapStorage>,
    pub(crate) page_size: usize,
    signature: [u8; SIGNATURE_SIZE],
    pub(crate) base_page_count: u64,
    pub(crate) fl_head: PageId,
    pub(crate) nappend: u64,
    pub(crate) overlay: HashMap<PageId, Vec<u8>>,
    pub(crate) fresh: HashSet<PageId>,
    pub(crate) released: Vec<PageId>,
    pub(crate) recycled: Vec<PageId>,
    start_seq: u64,
}

impl<'a> WriteTxn<'a> {
    pub fn new(
        storage: &'a RwLock<MmapStorage>,
        page_size: usize,
        signature: [u8; SIGNATURE_SIZE],
        fl_head: PageId,
        page_count: u64,
        start_seq: u64,
    ) -> Self {
        Self {
            storage,
            page_size,
            signature,
            base_page_count: page_count,
            fl_head,
            nappend: 0,
            overlay: HashMap::new(),
            fresh: HashSet::new(),
            released: Vec::new(),
            recycled: Vec::new(),
            start_seq,
        }
    }

    /// Runs `f` over the current bytes of a page, overlay first.
    pub(crate) fn with_page<R>(
        &self,
        id: PageId,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        if let Some(bytes) = self.overlay.get(&id) {
            return f(bytes);
        }

        ensure!(
            id < self.base_page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.base_page_count
        );

        let storage = self.storage.read();
        f(storage.page(id)?)
    }

    pub(crate) fn encode_page(&self, node: &Node) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_size];
        node.encode_into(&mut buf)?;
        Ok(buf)
    }

    pub(crate) fn next_append(&mut self) -> PageId {
        let id = self.base_page_count + self.nappend;
        self.nappend += 1;
        id
    }

    /// Places page bytes at a brand-new appended id, bypassing the
    /// free-list. The free-list maintenance itself allocates this way so
    /// that reclamation can never re-enter itself.
    pub(crate) fn append_bytes(&mut self, bytes: Vec<u8>) -> PageId {
        let id = self.next_append();
        self.overlay.insert(id, bytes);
        self.fresh.insert(id);
        id
    }

    pub(crate) fn alloc_bytes(&mut self, bytes: Vec<u8>) -> Result<PageId> {
        let id = if let Some(id) = self.recycled.pop() {
            id
        } else if let Some(id) = self.free_pop()? {
            id
        } else {
            self.next_append()
        };

        self.overlay.insert(id, bytes);
        self.fresh.insert(id);
        Ok(id)
    }

    /// Schedules a page for release. Pages born in this transaction never
    /// became durable, so they go straight back to the allocator instead.
    pub(crate) fn release_page(&mut self, id: PageId) {
        if self.fresh.remove(&id) {
            self.overlay.remove(&id);
            self.recycled.push(id);
        } else {
            self.released.push(id);
        }
    }

    pub(crate) fn page_count(&self) -> u64 {
        self.base_page_count + self.nappend
    }

    /// Makes the overlay durable and flips the master page. On
    /// `BeforeMasterWrite` the data pages are written and synced but the
    /// master is left untouched, modeling a crash mid-commit.
    pub(crate) fn commit(&mut self, new_root: PageId, fault: CommitFault) -> Result<CommitState> {
        let new_count = self.page_count();
        let commit_seq = self.start_seq + 1;

        let mut storage = self.storage.write();

        if new_count > storage.page_count() {
            let target = grow_target(storage.page_count(), new_count);
            storage.grow(target)?;
        }

        for (&id, bytes) in &self.overlay {
            storage.page_mut(id)?.copy_from_slice(bytes);
        }
        storage.sync()?;

        if fault == CommitFault::BeforeMasterWrite {
            debug!(commit_seq, "commit stopped before master write");
            return Ok(CommitState {
                root: new_root,
                freelist_head: self.fl_head,
                page_count: new_count,
                commit_seq,
            });
        }

        let master = MasterPage::new(
            self.signature,
            new_root,
            self.fl_head,
            new_count,
            commit_seq,
        );
        master.write_to(&mut storage.page_mut(0)?[..MASTER_SIZE])?;
        storage.sync()?;

        debug!(
            commit_seq,
            pages_written = self.overlay.len(),
            pages_released = self.released.len(),
            page_count = new_count,
            "commit durable"
        );

        Ok(CommitState {
            root: new_root,
            freelist_head: self.fl_head,
            page_count: new_count,
            commit_seq,
        })
    }
}

impl PageSource for WriteTxn<'_> {
    fn read_node(&self, id: PageId) -> Result<Node> {
        self.with_page(id, Node::decode)
    }
}

impl PageStore for WriteTxn<'_> {
    fn alloc_node(&mut self, node: &Node) -> Result<PageId> {
        let bytes = self.encode_page(node)?;
        self.alloc_bytes(bytes)
    }

    fn free_page(&mut self, id: PageId) {
        self.release_page(id);
    }
}
