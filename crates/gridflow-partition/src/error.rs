//! Partition Error Types
//!
//! Errors raised by result partitions, subpartitions, and spill files.
//!
//! ## Error Categories
//!
//! ### Lifecycle Errors
//! - `PartitionReleased`: the partition was released while an operation was
//!   in flight; readers observe this instead of corrupt state
//! - `AddAfterFinish`: writing to a finished (sub)partition is a programming
//!   error and is rejected
//! - `ReadBeforeFinish`: bounded-blocking data is only readable once sealed
//! - `ViewAlreadyCreated`: a pipelined subpartition has exactly one live view
//!
//! ### Spill File Errors
//! - `InvalidMagic` / `UnsupportedVersion` / `CrcMismatch`: the spill file on
//!   disk is not one of ours, from a newer writer, or corrupt
//! - `InvalidSpillFile`: structurally malformed spill data

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] gridflow_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Partition released")]
    PartitionReleased,

    #[error("Cannot add buffers after finish")]
    AddAfterFinish,

    #[error("Cannot read a bounded-blocking subpartition before finish")]
    ReadBeforeFinish,

    #[error("Subpartition already has an active read view")]
    ViewAlreadyCreated,

    #[error("Invalid subpartition index {index} (partition has {count} subpartitions)")]
    InvalidSubpartition { index: usize, count: usize },

    #[error("Invalid spill file: {0}")]
    InvalidSpillFile(String),

    #[error("Spill file magic bytes mismatch")]
    InvalidMagic,

    #[error("Unsupported spill file version: {0}")]
    UnsupportedVersion(u16),

    #[error("Spill file CRC mismatch")]
    CrcMismatch,
}
