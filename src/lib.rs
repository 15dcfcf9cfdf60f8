//! # WrenDB - Embedded Ordered Key-Value Store
//!
//! WrenDB is a single-file storage engine built around a persistent
//! (copy-on-write) B+Tree over fixed-size pages. It offers ordered byte-key
//! to byte-value storage with snapshot-consistent reads, a single writer,
//! and crash-atomic commits.
//!
//! ## Quick Start
//!
//! ```ignore
//! use wrendb::{Engine, Options};
//!
//! let engine = Engine::open("./wren.db", Options::default())?;
//!
//! engine.set(b"hello", b"world")?;
//! assert_eq!(engine.get(b"hello")?, Some(b"world".to_vec()));
//!
//! let reader = engine.reader();          // pinned snapshot
//! let mut cursor = reader.scan()?;       // ordered iteration
//! while let Some((key, value)) = cursor.next()? {
//!     println!("{:?} => {:?}", key, value);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │    Engine (snapshots, writer seat)   │
//! ├─────────────────────────────────────┤
//! │      Copy-on-Write B+Tree            │
//! ├──────────────────┬──────────────────┤
//! │   Node Codec     │   Free-List      │
//! ├──────────────────┴──────────────────┤
//! │  Page Store (overlay, atomic commit) │
//! ├─────────────────────────────────────┤
//! │     Memory-Mapped Single File        │
//! └─────────────────────────────────────┘
//! ```
//!
//! Committed pages are immutable. A write transaction builds replacement
//! pages in a private overlay and publishes them by atomically rewriting
//! the master page; readers pin the previous root and keep a stable view
//! for as long as they live. Freed pages return through a persistent
//! free-list once no snapshot can reach them.
//!
//! ## Module Overview
//!
//! - [`node`]: leaf and pointer node codec and transformations
//! - [`store`]: mmap storage, master page, free-list, write transactions
//! - [`tree`]: the copy-on-write B+Tree and its cursor
//! - [`engine`]: the public engine with readers and writers
//! - [`net`]: optional TCP front-end used by the `serve` subcommand

pub mod engine;
pub mod net;
pub mod node;
pub mod store;
pub mod tree;

pub use engine::{CheckReport, Engine, Options, Reader, Stats, Writer};
pub use store::PageId;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
