//! Error Types for the GridFlow Core Crate
//!
//! This module defines the errors shared by the buffer and pool layer.
//!
//! ## Error Categories
//!
//! ### Memory Errors
//! - `PoolDestroyed`: the buffer pool was torn down while a request was pending
//! - `InsufficientBuffers`: a quota change asked for fewer pages than are pinned
//!
//! ### Data Integrity Errors
//! - `InvalidCompression`: unknown compression codec id on the wire or on disk
//! - `Decompression`: decompressing a buffer payload failed (likely corruption)
//! - `InvalidBuffer`: malformed buffer metadata (e.g. unknown event kind)
//!
//! ## Usage
//! All fallible operations return `Result<T>`, aliased to `Result<T, Error>`,
//! so call sites propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer pool destroyed")]
    PoolDestroyed,

    #[error("Insufficient buffers: requested quota {requested}, {outstanding} outstanding")]
    InsufficientBuffers { requested: usize, outstanding: usize },

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u8),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
