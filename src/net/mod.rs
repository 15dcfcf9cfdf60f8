//! # TCP Front-End
//!
//! A small framed protocol over the engine for remote gets, sets and
//! deletes. The core engine knows nothing about this module; it is one of
//! the collaborators layered on top, wired up by the `serve` subcommand.
//!
//! - `proto`: wire format (command byte, big-endian length, payload)
//! - `server`: blocking accept loop feeding a worker-thread pool

pub mod proto;
pub mod server;

pub use proto::{Command, Response, Status};
pub use server::{Server, ServerHandle};
