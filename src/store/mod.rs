//! # Storage Layer
//!
//! This module owns everything that touches the database file: the
//! memory-mapped page store, the master page, the persistent free-list, and
//! the write-transaction page overlay that makes commits atomic.
//!
//! ## File layout
//!
//! A WrenDB database is a single file of fixed-size pages:
//!
//! ```text
//! Offset 0:            Page 0, the master page
//! Offset page_size:    Page 1
//! Offset 2*page_size:  Page 2
//! ...
//! ```
//!
//! The file size is always a multiple of the page size. Pages hold tree
//! nodes, free-list nodes, or nothing at all (formerly used, awaiting
//! reclamation). Page id 0 is reserved for the master page and is never
//! allocated.
//!
//! ## Master page
//!
//! The master page is the single linearization point of the engine. Its
//! first 48 bytes are:
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------
//! 0       16    signature      File-format tag, checked on open
//! 16      8     root           Tree root page id (0 = empty tree)
//! 24      8     freelist_head  Head of the free-list chain (0 = none)
//! 32      8     page_count     Pages accounted for by this commit
//! 40      8     commit_seq     Monotonic commit sequence number
//! ```
//!
//! The rest of page 0 is zero. A commit first makes every new page durable,
//! then overwrites these 48 bytes and syncs again; a crash between the two
//! syncs leaves the previous master intact and the new pages unreachable.
//!
//! ## Copy-on-write
//!
//! Committed pages are never modified. A write transaction accumulates
//! replacement pages in a private overlay ([`WriteTxn`]) and frees the pages
//! it replaced; the overlay only reaches the file at commit. Readers
//! therefore never need coordination beyond the growth lock around the
//! mapping itself.

mod freelist;
mod mmap;
mod pager;

pub use freelist::{freelist_capacity, FreeListNode, FREELIST_HEADER_SIZE};
pub use mmap::MmapStorage;
pub use pager::{CommitFault, CommitState, WriteTxn};

use eyre::{ensure, Result};
use zerocopy::big_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// 64-bit ordinal addressing a page within the file.
pub type PageId = u64;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 1 << 16;

pub const SIGNATURE_SIZE: usize = 16;
pub const DEFAULT_SIGNATURE: [u8; SIGNATURE_SIZE] = *b"WrenDB_KV_File:\0";

pub const MASTER_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    signature: [u8; SIGNATURE_SIZE],
    root: U64,
    freelist_head: U64,
    page_count: U64,
    commit_seq: U64,
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_SIZE);

impl MasterPage {
    pub fn new(
        signature: [u8; SIGNATURE_SIZE],
        root: PageId,
        freelist_head: PageId,
        page_count: u64,
        commit_seq: u64,
    ) -> Self {
        Self {
            signature,
            root: U64::new(root),
            freelist_head: U64::new(freelist_head),
            page_count: U64::new(page_count),
            commit_seq: U64::new(commit_seq),
        }
    }

    /// Parses and validates the master page against the expected signature
    /// and the physical size of the file.
    pub fn from_bytes<'a>(
        data: &'a [u8],
        signature: &[u8; SIGNATURE_SIZE],
        file_pages: u64,
    ) -> Result<&'a Self> {
        ensure!(
            data.len() >= MASTER_SIZE,
            "malformed master page: {} bytes, need {}",
            data.len(),
            MASTER_SIZE
        );

        let master = Self::ref_from_bytes(&data[..MASTER_SIZE])
            .map_err(|e| eyre::eyre!("malformed master page: {:?}", e))?;

        ensure!(
            &master.signature == signature,
            "malformed master page: signature mismatch"
        );

        let page_count = master.page_count.get();
        ensure!(
            page_count >= 1 && page_count <= file_pages,
            "malformed master page: page count {} outside file of {} pages",
            page_count,
            file_pages
        );
        ensure!(
            master.root.get() < page_count,
            "malformed master page: root {} out of range",
            master.root.get()
        );
        ensure!(
            master.freelist_head.get() < page_count,
            "malformed master page: free-list head {} out of range",
            master.freelist_head.get()
        );

        Ok(master)
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= MASTER_SIZE,
            "malformed master page: {} bytes, need {}",
            data.len(),
            MASTER_SIZE
        );

        data[..MASTER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn root(&self) -> PageId {
        self.root.get()
    }

    pub fn freelist_head(&self) -> PageId {
        self.freelist_head.get()
    }

    pub fn page_count(&self) -> u64 {
        self.page_count.get()
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq.get()
    }
}

/// File growth policy: extend by at least an eighth of the current size,
/// minimum one page, repeated until `needed` pages fit.
pub fn grow_target(mut current: u64, needed: u64) -> u64 {
    while current < needed {
        current += (current / 8).max(1);
    }
    current
}
