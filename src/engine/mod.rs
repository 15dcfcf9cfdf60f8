//! # Storage Engine
//!
//! `Engine` ties the pieces together: it owns the database file, the
//! committed state (tree root, free-list head, page count, commit
//! sequence), the single-writer permit, and the registry of live reader
//! snapshots.
//!
//! ## Concurrency model
//!
//! - One writer at a time, enforced by a mutex. Readers run concurrently
//!   with each other and with the writer.
//! - A reader snapshot is the (root, page count, sequence) triple observed
//!   at creation. Copy-on-write guarantees the pages under it never change;
//!   the registry keeps their ids out of circulation until the snapshot
//!   closes.
//! - Commits are ordered by the sequence number and become visible to new
//!   readers atomically when the committed state is swapped, right after
//!   the master page hits disk.
//! - A read-write lock around the mapping coordinates file growth with
//!   concurrent page reads; it is not the writer mutex.
//!
//! ## Deferred reclamation
//!
//! Pages released at commit sequence `s` were reachable in every state
//! before `s`, so they stay in an in-memory pending list until no live
//! reader holds a snapshot older than `s`. Each commit starts by splicing
//! every pending batch that has become safe into the persistent free-list;
//! `close` runs one final splice so a cleanly shut down file accounts for
//! every page on disk.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::info;

use crate::node::Node;
use crate::store::{
    CommitState, MasterPage, MmapStorage, PageId, WriteTxn, DEFAULT_PAGE_SIZE, DEFAULT_SIGNATURE,
    MASTER_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, SIGNATURE_SIZE,
};
use crate::tree::PageSource;

/// Engine construction options. The page size is fixed at file creation and
/// must be passed identically on every later open; the signature tags the
/// file format and is validated against the master page.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub page_size: usize,
    pub signature: [u8; SIGNATURE_SIZE],
}

impl Default for Options {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            signature: DEFAULT_SIGNATURE,
        }
    }
}

/// Point-in-time counters, mostly for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub root: PageId,
    pub freelist_head: PageId,
    pub page_count: u64,
    pub commit_seq: u64,
    pub live_readers: usize,
    pub pending_free: usize,
}

/// Outcome of a consistency walk over the whole file. Structural damage is
/// an error; pages that are merely unaccounted for (possible after a crash)
/// are reported here instead.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub depth: usize,
    pub tree_pages: usize,
    pub freelist_nodes: usize,
    pub free_ids: usize,
    pub pending_ids: usize,
    pub leaked: Vec<PageId>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) options: Options,
    pub(crate) storage: RwLock<MmapStorage>,
    pub(crate) state: Mutex<CommitState>,
    pub(crate) write_lock: Mutex<()>,
    /// Live snapshot sequences and how many readers hold each.
    pub(crate) readers: Mutex<BTreeMap<u64, usize>>,
    pub(crate) readers_cv: Condvar,
    /// Release batches not yet spliced into the free-list, keyed by the
    /// commit sequence that freed them.
    pub(crate) pending: Mutex<Vec<(u64, Vec<PageId>)>>,
}

impl Shared {
    pub(crate) fn oldest_reader_seq(&self) -> Option<u64> {
        let _state = self.state.lock();
        let readers = self.readers.lock();
        readers.keys().next().copied()
    }
}

#[derive(Debug)]
pub struct Engine {
    shared: Arc<Shared>,
    path: PathBuf,
}

impl Engine {
    /// Opens the database file at `path`, creating it when absent or empty.
    /// A fresh file starts with an empty tree and commit sequence 0.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&options.page_size),
            "page size {} outside supported range [{}, {}]",
            options.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );

        let path = path.as_ref().to_path_buf();
        let exists = path.exists() && std::fs::metadata(&path)?.len() > 0;

        let (storage, state) = if exists {
            let storage = MmapStorage::open(&path, options.page_size)?;
            let state = {
                let master = MasterPage::from_bytes(
                    storage.page(0)?,
                    &options.signature,
                    storage.page_count(),
                )?;
                CommitState {
                    root: master.root(),
                    freelist_head: master.freelist_head(),
                    page_count: master.page_count(),
                    commit_seq: master.commit_seq(),
                }
            };
            info!(path = %path.display(), commit_seq = state.commit_seq, "opened database");
            (storage, state)
        } else {
            let mut storage = MmapStorage::create(&path, options.page_size, 1)?;
            let master = MasterPage::new(options.signature, 0, 0, 1, 0);
            master.write_to(&mut storage.page_mut(0)?[..MASTER_SIZE])?;
            storage.sync()?;
            info!(path = %path.display(), "created database");
            (
                storage,
                CommitState {
                    root: 0,
                    freelist_head: 0,
                    page_count: 1,
                    commit_seq: 0,
                },
            )
        };

        Ok(Self {
            shared: Arc::new(Shared {
                options,
                storage: RwLock::new(storage),
                state: Mutex::new(state),
                write_lock: Mutex::new(()),
                readers: Mutex::new(BTreeMap::new()),
                readers_cv: Condvar::new(),
                pending: Mutex::new(Vec::new()),
            }),
            path,
        })
    }

    /// Takes a snapshot of the current committed state. The snapshot stays
    /// readable and point-in-time consistent until the reader is dropped.
    pub fn reader(&self) -> Reader {
        let state_guard = self.shared.state.lock();
        let state = *state_guard;
        {
            let mut readers = self.shared.readers.lock();
            *readers.entry(state.commit_seq).or_insert(0) += 1;
        }
        drop(state_guard);

        Reader::new(self.shared.clone(), state)
    }

    /// Acquires the single writer seat; blocks while another writer is
    /// active. The transaction starts from the current committed root with
    /// an empty overlay.
    pub fn writer(&self) -> Writer<'_> {
        let permit = self.shared.write_lock.lock();
        let state = *self.shared.state.lock();

        let txn = WriteTxn::new(
            &self.shared.storage,
            self.shared.options.page_size,
            self.shared.options.signature,
            state.freelist_head,
            state.page_count,
            state.commit_seq,
        );

        Writer::new(&self.shared, txn, state.root, permit)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reader().get(key)
    }

    pub fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut writer = self.writer();
        writer.set(key, val)?;
        writer.commit()
    }

    /// Returns whether the key existed. A miss aborts the transaction
    /// instead of burning a commit sequence.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut writer = self.writer();
        if writer.delete(key)? {
            writer.commit()?;
            Ok(true)
        } else {
            writer.abort();
            Ok(false)
        }
    }

    pub fn stats(&self) -> Stats {
        let state = *self.shared.state.lock();
        let live_readers = self.shared.readers.lock().values().sum();
        let pending_free = self
            .shared
            .pending
            .lock()
            .iter()
            .map(|(_, ids)| ids.len())
            .sum();

        Stats {
            root: state.root,
            freelist_head: state.freelist_head,
            page_count: state.page_count,
            commit_seq: state.commit_seq,
            live_readers,
            pending_free,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walks the committed tree and free-list and verifies the structural
    /// invariants: unique page use, uniform leaf depth, strictly increasing
    /// keys, separators equal to child least keys, and full accounting of
    /// every page below the committed page count.
    pub fn check(&self) -> Result<CheckReport> {
        let _permit = self.shared.write_lock.lock();
        let state = *self.shared.state.lock();
        let source = CheckSource {
            shared: &self.shared,
            page_count: state.page_count,
        };

        let mut seen: HashMap<PageId, &'static str> = HashMap::new();
        let mut report = CheckReport::default();

        if state.root != 0 {
            let mut last_key: Option<Vec<u8>> = None;
            report.depth = check_subtree(
                &source,
                state.root,
                None,
                &mut seen,
                &mut last_key,
                &mut report,
                self.shared.options.page_size,
            )?;
        }

        let mut fl = state.freelist_head;
        while fl != 0 {
            claim(&mut seen, fl, "free-list node", state.page_count)?;
            report.freelist_nodes += 1;
            ensure!(
                report.freelist_nodes as u64 <= state.page_count,
                "free-list chain does not terminate"
            );

            let node = source.shared.read_freelist_raw(fl, state.page_count)?;
            for id in &node.ids {
                claim(&mut seen, *id, "free id", state.page_count)?;
                report.free_ids += 1;
            }
            fl = node.next;
        }

        for (_, ids) in self.shared.pending.lock().iter() {
            for id in ids {
                claim(&mut seen, *id, "pending release", state.page_count)?;
                report.pending_ids += 1;
            }
        }

        for id in 1..state.page_count {
            if !seen.contains_key(&id) {
                report.leaked.push(id);
            }
        }

        Ok(report)
    }

    /// Splices any still-pending frees, waits for every reader to finish,
    /// and syncs the file.
    pub fn close(self) -> Result<()> {
        let quiescent =
            self.shared.readers.lock().is_empty() && !self.shared.pending.lock().is_empty();
        if quiescent {
            // Reclamation-only commit: same root, all safe batches spliced.
            self.writer().commit()?;
        }

        let mut readers = self.shared.readers.lock();
        while !readers.is_empty() {
            self.shared.readers_cv.wait(&mut readers);
        }
        drop(readers);

        self.shared.storage.read().sync()?;
        info!(path = %self.path.display(), "closed database");
        Ok(())
    }
}

struct CheckSource<'a> {
    shared: &'a Shared,
    page_count: u64,
}

impl PageSource for CheckSource<'_> {
    fn read_node(&self, id: PageId) -> Result<Node> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );
        let storage = self.shared.storage.read();
        Node::decode(storage.page(id)?)
    }
}

impl Shared {
    fn read_freelist_raw(
        &self,
        id: PageId,
        page_count: u64,
    ) -> Result<crate::store::FreeListNode> {
        ensure!(
            id < page_count,
            "page {} out of bounds (page_count={})",
            id,
            page_count
        );
        let storage = self.storage.read();
        crate::store::FreeListNode::decode(storage.page(id)?)
    }
}

fn claim(
    seen: &mut HashMap<PageId, &'static str>,
    id: PageId,
    role: &'static str,
    page_count: u64,
) -> Result<()> {
    ensure!(id != 0, "page 0 referenced as {}", role);
    ensure!(
        id < page_count,
        "page {} out of bounds (page_count={})",
        id,
        page_count
    );
    if let Some(prev) = seen.insert(id, role) {
        bail!("page {} referenced twice: as {} and as {}", id, prev, role);
    }
    Ok(())
}

/// Recursive structural check. Returns the subtree depth and enforces that
/// it is uniform across siblings.
fn check_subtree(
    source: &CheckSource<'_>,
    id: PageId,
    expected_first_key: Option<&[u8]>,
    seen: &mut HashMap<PageId, &'static str>,
    last_key: &mut Option<Vec<u8>>,
    report: &mut CheckReport,
    page_size: usize,
) -> Result<usize> {
    claim(seen, id, "tree node", source.page_count)?;
    report.tree_pages += 1;

    let node = source.read_node(id)?;
    ensure!(
        node.encoded_size() <= page_size,
        "node at page {} exceeds the page size",
        id
    );
    ensure!(node.entry_count() > 0, "empty node at page {}", id);

    if let Some(expected) = expected_first_key {
        ensure!(
            node.first_key()? == expected,
            "separator does not match least key of page {}",
            id
        );
    }

    match node {
        Node::Leaf(leaf) => {
            for (key, _) in leaf.iter() {
                if let Some(prev) = last_key.as_deref() {
                    ensure!(
                        prev < key,
                        "keys out of order at page {}: {:?} after {:?}",
                        id,
                        key,
                        prev
                    );
                }
                *last_key = Some(key.to_vec());
            }
            Ok(1)
        }
        Node::Pointer(ptr) => {
            let mut depth = None;
            for index in 0..ptr.entry_count() {
                let child_depth = check_subtree(
                    source,
                    ptr.child_at(index)?,
                    Some(ptr.key_at(index)?),
                    seen,
                    last_key,
                    report,
                    page_size,
                )?;
                if let Some(depth) = depth {
                    ensure!(
                        depth == child_depth,
                        "leaf depth is not uniform under page {}",
                        id
                    );
                } else {
                    depth = Some(child_depth);
                }
            }
            Ok(depth.unwrap_or(0) + 1)
        }
    }
}
