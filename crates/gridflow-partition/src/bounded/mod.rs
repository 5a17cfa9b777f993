//! Bounded-Blocking Subpartition - Disk-Spilled Batch Exchange
//!
//! For blocking (batch) exchanges, holding a whole partition in memory is
//! infeasible. This variant writes the full subpartition to disk exactly
//! once, seals it, and then serves it to arbitrarily many concurrent
//! readers, each with an independent cursor — including retried downstream
//! stages re-reading from the start.
//!
//! ## Spill File Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (8 bytes)                                         │
//! │ - Magic bytes: "GFSP" (4 bytes)                          │
//! │ - Version: 1 (2 bytes)                                   │
//! │ - Reserved (2 bytes)                                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ Buffer entries, grouped into regions                     │
//! │ - Length (4 bytes)                                       │
//! │ - Data type (1 byte)                                     │
//! │ - Compressed flag (1 byte)                               │
//! │ - Payload                                                │
//! ├──────────────────────────────────────────────────────────┤
//! │ Region index                                             │
//! │ - For each region:                                       │
//! │   * File offset (8 bytes)                                │
//! │   * First buffer sequence number (4 bytes)               │
//! │   * Buffer count (4 bytes)                               │
//! ├──────────────────────────────────────────────────────────┤
//! │ Footer (28 bytes)                                        │
//! │ - Index position (8 bytes)                               │
//! │ - Region count (4 bytes)                                 │
//! │ - Total buffers (4 bytes)                                │
//! │ - Data buffers (4 bytes)                                 │
//! │ - CRC32 of everything before the footer (4 bytes)        │
//! │ - Magic bytes: "GFSP" again (4 bytes)                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A region is sealed once it reaches the configured size; entries never
//! straddle a region boundary, so a boundary landing exactly on a buffer
//! boundary decodes like any other. The in-memory region index gives
//! logarithmic seeks to a buffer sequence number without scanning.
//!
//! ## Storage Strategies
//!
//! Two interchangeable read paths behind the same view interface:
//! - **File-channel**: every view opens its own file handle and reads
//!   sequentially from its region cursor.
//! - **Memory-mapped**: the file is mapped read-only after `finish()`;
//!   views slice the mapping without per-read syscalls.
//!
//! ## Lifecycle Rules
//!
//! Writing after `finish()` and reading before `finish()` are rejected.
//! After `finish()` the data is immutable and shared read-only, so views
//! never interfere. Compressed buffers stay compressed on disk; expansion
//! happens lazily where the buffer is consumed, never on the write path.

mod reader;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gridflow_core::{Buffer, ResultPartitionId};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::view::BufferAvailabilityListener;

pub use reader::BoundedBlockingSubpartitionView;
pub(crate) use reader::SpillFile;
pub(crate) use writer::SpillWriter;

/// Magic bytes for spill files: "GFSP"
pub const SPILL_MAGIC: [u8; 4] = *b"GFSP";

/// Version number of the spill file format
pub const SPILL_VERSION: u16 = 1;

/// Spill file header size (8 bytes)
pub const HEADER_SIZE: usize = 8;

/// Spill file footer size (28 bytes)
pub const FOOTER_SIZE: usize = 28;

/// Per-buffer entry header: length + data type + compressed flag
pub const ENTRY_HEADER_SIZE: usize = 6;

/// Bytes of one on-disk region index entry
pub const INDEX_ENTRY_SIZE: usize = 16;

/// How a sealed subpartition is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedStorageKind {
    /// Independent file handle per reader.
    FileChannel,
    /// Read-only memory mapping shared by all readers.
    MemoryMapped,
}

/// A contiguous, sealed run of spilled buffers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    pub file_offset: u64,
    pub first_buffer: u32,
    pub num_buffers: u32,
}

struct BoundedState {
    writer: Option<SpillWriter>,
    file: Option<Arc<SpillFile>>,
    finished: bool,
}

/// Disk-spilled subpartition for bounded-blocking exchanges.
pub struct BoundedBlockingSubpartition {
    parent: ResultPartitionId,
    index: u32,
    storage_kind: BoundedStorageKind,
    path: PathBuf,
    state: Mutex<BoundedState>,
    released: Arc<AtomicBool>,
}

impl BoundedBlockingSubpartition {
    pub fn new(
        parent: ResultPartitionId,
        index: u32,
        path: PathBuf,
        region_size: usize,
        storage_kind: BoundedStorageKind,
    ) -> Result<Self> {
        let writer = SpillWriter::create(&path, region_size)?;
        Ok(Self {
            parent,
            index,
            storage_kind,
            path,
            state: Mutex::new(BoundedState {
                writer: Some(writer),
                file: None,
                finished: false,
            }),
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Append one complete buffer to the current region. Producer thread
    /// only; may block on disk IO.
    pub fn add_buffer(&self, buffer: &Buffer) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.released.load(Ordering::Acquire) {
            return Err(Error::PartitionReleased);
        }
        if state.finished {
            return Err(Error::AddAfterFinish);
        }
        let Some(writer) = state.writer.as_mut() else {
            return Err(Error::AddAfterFinish);
        };
        writer.write_buffer(buffer)
    }

    /// Push buffered bytes to the OS. A no-op with zero pending bytes.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Seal the final region, write index and footer, and make the
    /// subpartition readable. Idempotent.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.released.load(Ordering::Acquire) {
            return Err(Error::PartitionReleased);
        }
        if state.finished {
            return Ok(());
        }
        let Some(writer) = state.writer.take() else {
            return Ok(());
        };
        writer.finish()?;
        let file = SpillFile::open(&self.path, self.storage_kind)?;
        debug!(
            partition = %self.parent,
            index = self.index,
            buffers = file.total_buffers(),
            regions = file.num_regions(),
            "sealed bounded-blocking subpartition"
        );
        state.file = Some(Arc::new(file));
        state.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// Open an independent read cursor. Rejected before `finish()`.
    pub fn create_read_view(
        &self,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<BoundedBlockingSubpartitionView> {
        let view = {
            let state = self.state.lock().unwrap();
            if self.released.load(Ordering::Acquire) {
                return Err(Error::PartitionReleased);
            }
            let Some(file) = state.file.as_ref() else {
                return Err(Error::ReadBeforeFinish);
            };
            BoundedBlockingSubpartitionView::new(file.clone(), self.released.clone())?
        };
        // Everything is already on disk, so the view is readable at once.
        listener.notify_data_available();
        Ok(view)
    }

    /// Reclaim disk resources. Safe to call concurrently with in-flight
    /// reads (they observe `PartitionReleased`); idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.writer = None;
        state.file = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove spill file: {e}");
            }
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Data buffers spilled so far.
    pub fn data_buffers(&self) -> u32 {
        let state = self.state.lock().unwrap();
        match (&state.file, &state.writer) {
            (Some(file), _) => file.data_buffers(),
            (None, Some(writer)) => writer.data_buffers(),
            (None, None) => 0,
        }
    }
}

impl Drop for BoundedBlockingSubpartition {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release();
        }
    }
}
