//! # Memory-Mapped File Storage
//!
//! `MmapStorage` maps the whole database file into the process address space
//! and hands out bounds-checked page slices. Reads are zero-copy; writes go
//! through `page_mut` and become durable on `sync`.
//!
//! ## Remapping on growth
//!
//! Growing the file invalidates the previous mapping, so `grow` flushes,
//! extends the file, and remaps it. `grow` takes `&mut self`; callers
//! serialize growth against concurrent page reads with the read-write lock
//! the engine wraps around this type, which is also why no page slice may
//! outlive its lock guard.
//!
//! ## Durability
//!
//! `sync` performs a blocking msync of the mapping. The commit protocol
//! calls it twice: once after the data pages, once after the master page.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PageId;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_size: usize,
    page_count: u64,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty database file '{}'",
            path.display()
        );
        ensure!(
            file_size % page_size as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let page_count = file_size / page_size as u64;

        // SAFETY: the engine owns this file exclusively for the lifetime of
        // the process; external mutation of a live database file is outside
        // the supported model. The mapping is dropped before the file, and
        // every access goes through page()/page_mut() which bounds-check.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, page_size: usize, initial_pages: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_pages > 0, "initial page count must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_size = initial_pages * page_size as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size file to {} bytes", file_size))?;

        // SAFETY: freshly created file with exclusive access, sized to a
        // page multiple above; same access discipline as open().
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count: initial_pages,
        })
    }

    pub fn page(&self, id: PageId) -> Result<&[u8]> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );

        let offset = id as usize * self.page_size;
        Ok(&self.mmap[offset..offset + self.page_size])
    }

    pub fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        ensure!(
            id < self.page_count,
            "page {} out of bounds (page_count={})",
            id,
            self.page_count
        );

        let offset = id as usize * self.page_size;
        Ok(&mut self.mmap[offset..offset + self.page_size])
    }

    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush mapping before grow")?;

        let new_size = new_page_count * self.page_size as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: grow() holds &mut self, so no page slice can be live; the
        // old mapping was flushed and is dropped on reassignment.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = new_page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mapping to disk")
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * self.page_size as u64
    }
}
