//! The write half of the engine. A `Writer` owns the single writer seat
//! (a mutex guard) plus the transaction's page overlay; dropping it without
//! committing aborts: the overlay is discarded and the seat freed, leaving
//! the committed state untouched.

use eyre::{ensure, Result};
use parking_lot::MutexGuard;
use tracing::debug;

use crate::node::{LEAF_ENTRY_OVERHEAD, NODE_HEADER_SIZE, POINTER_ENTRY_OVERHEAD};
use crate::store::{CommitFault, PageId, WriteTxn};
use crate::tree::BTree;

use super::Shared;

pub struct Writer<'a> {
    shared: &'a Shared,
    txn: WriteTxn<'a>,
    root: PageId,
    finished: bool,
    _permit: MutexGuard<'a, ()>,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(
        shared: &'a Shared,
        txn: WriteTxn<'a>,
        root: PageId,
        permit: MutexGuard<'a, ()>,
    ) -> Self {
        Self {
            shared,
            txn,
            root,
            finished: false,
            _permit: permit,
        }
    }

    /// Inserts the pair, replacing the value when the key is present. The
    /// pair must fit a single page as a leaf entry, and the key must also
    /// fit as a pointer-node separator.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        let page_size = self.txn.page_size;

        ensure!(
            NODE_HEADER_SIZE + LEAF_ENTRY_OVERHEAD + key.len() + val.len() <= page_size,
            "entry too large: {} byte pair exceeds a {} byte page",
            key.len() + val.len(),
            page_size
        );
        ensure!(
            NODE_HEADER_SIZE + POINTER_ENTRY_OVERHEAD + key.len() <= page_size,
            "key too large: {} bytes cannot fit a separator entry",
            key.len()
        );

        let mut tree = BTree::new(&mut self.txn, self.root, page_size);
        tree.set(key, val)?;
        self.root = tree.root();
        Ok(())
    }

    /// Removes the key; returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let page_size = self.txn.page_size;
        let mut tree = BTree::new(&mut self.txn, self.root, page_size);
        let deleted = tree.delete(key)?;
        self.root = tree.root();
        Ok(deleted)
    }

    /// Makes every change of this transaction durable and visible to new
    /// readers, in one atomic step.
    pub fn commit(self) -> Result<()> {
        self.commit_with_fault(CommitFault::None)
    }

    /// Commit with a crash-injection point; used by recovery tests.
    pub(crate) fn commit_with_fault(mut self, fault: CommitFault) -> Result<()> {
        // Splice every pending batch that no live snapshot can still
        // reach. A batch freed at sequence s is safe once the oldest
        // reader's snapshot is at least s.
        let oldest = self.shared.oldest_reader_seq();
        let mut taken: Vec<(u64, Vec<PageId>)> = Vec::new();
        {
            let mut pending = self.shared.pending.lock();
            let mut keep = Vec::new();
            for batch in pending.drain(..) {
                if oldest.map_or(true, |o| o >= batch.0) {
                    taken.push(batch);
                } else {
                    keep.push(batch);
                }
            }
            *pending = keep;
        }

        let mut splice: Vec<PageId> = taken.iter().flat_map(|(_, ids)| ids.clone()).collect();
        // Pages this transaction allocated and then discarded were never
        // visible anywhere; they can reenter circulation right away.
        splice.append(&mut self.txn.recycled);

        let result = match self.txn.free_push_all(splice) {
            Ok(()) => self.txn.commit(self.root, fault),
            Err(err) => Err(err),
        };

        let state = match result {
            Ok(state) => state,
            Err(err) => {
                // The splice never became durable; put the batches back so
                // their pages stay accounted for.
                self.shared.pending.lock().extend(taken);
                self.finished = true;
                return Err(err);
            }
        };

        self.finished = true;

        if fault != CommitFault::None {
            return Ok(());
        }

        let released = std::mem::take(&mut self.txn.released);
        {
            let mut committed = self.shared.state.lock();
            *committed = state;
        }
        if !released.is_empty() {
            // This commit's own frees were reachable until just now; they
            // wait for snapshots taken before it to wind down.
            self.shared
                .pending
                .lock()
                .push((state.commit_seq, released));
        }

        debug!(commit_seq = state.commit_seq, root = state.root, "commit published");
        Ok(())
    }

    /// Discards the overlay and frees the writer seat. Dropping the writer
    /// has the same effect.
    pub fn abort(self) {}
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("write transaction aborted");
        }
    }
}
