//! The read half of the engine. A `Reader` pins the (root, page count,
//! sequence) triple current at creation; copy-on-write plus deferred
//! reclamation guarantee that every page below it keeps its content until
//! the reader is dropped, no matter how many commits land in between.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::node::Node;
use crate::store::{CommitState, PageId};
use crate::tree::{self, Cursor, PageSource};

use super::Shared;

pub struct Reader {
    shared: Arc<Shared>,
    root: PageId,
    page_count: u64,
    seq: u64,
}

impl Reader {
    pub(crate) fn new(shared: Arc<Shared>, state: CommitState) -> Self {
        Self {
            shared,
            root: state.root,
            page_count: state.page_count,
            seq: state.commit_seq,
        }
    }

    /// The commit sequence this snapshot observes.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree::get(self, self.root, key)
    }

    /// Cursor over all pairs with key >= `key`, in order.
    pub fn seek(&self, key: &[u8]) -> Result<Cursor<'_, Reader>> {
        Cursor::seek(self, self.root, key)
    }

    /// Cursor over the whole snapshot, in key order.
    pub fn scan(&self) -> Result<Cursor<'_, Reader>> {
        self.seek(&[])
    }

    /// Ends the snapshot. Dropping the reader has the same effect.
    pub fn close(self) {}
}

impl PageSource for Reader {
    fn read_node(&self, id: PageId) -> Result<Node> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (snapshot page_count={})",
            id,
            self.page_count
        );

        let storage = self.shared.storage.read();
        Node::decode(storage.page(id)?)
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let mut readers = self.shared.readers.lock();
        if let Some(count) = readers.get_mut(&self.seq) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&self.seq);
            }
        }
        drop(readers);
        self.shared.readers_cv.notify_all();
    }
}
