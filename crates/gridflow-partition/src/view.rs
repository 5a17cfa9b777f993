//! Subpartition read views.
//!
//! A view is one consumer's cursor into one subpartition. Views always
//! deliver buffers in strict append order; the two subpartition variants
//! plug in behind the same trait so the network layer does not care whether
//! data lives in memory or on disk.

use gridflow_core::{Buffer, DataType};

use crate::error::Result;

/// Callback fired when a view that previously had nothing to read becomes
/// readable. Connects subpartitions to the partition request queue without
/// polling.
pub trait BufferAvailabilityListener: Send + Sync {
    fn notify_data_available(&self);
}

impl<F: Fn() + Send + Sync> BufferAvailabilityListener for F {
    fn notify_data_available(&self) {
        self()
    }
}

/// A delivered buffer plus queue state observed at delivery time.
#[derive(Debug)]
pub struct BufferAndBacklog {
    pub buffer: Buffer,
    /// Finished data buffers still queued behind this one.
    pub backlog: i64,
    /// Type of the next readable buffer, if one is already known.
    pub next_data_type: Option<DataType>,
}

/// Per-consumer read cursor over one subpartition.
pub trait SubpartitionView: Send + Sync {
    /// Next buffer in append order, or `None` when nothing is readable yet.
    fn poll_buffer(&self) -> Result<Option<BufferAndBacklog>>;

    /// Finished-but-undelivered data buffers; `-1` once the view is
    /// exhausted (subpartition finished and everything delivered).
    fn backlog(&self) -> i64;

    /// Type of the buffer the next successful poll would return.
    fn peek_next_data_type(&self) -> Option<DataType>;

    /// Whether a poll would succeed given the consumer's remaining credits.
    /// Events are always deliverable; data needs at least one credit.
    fn is_available(&self, num_credits: u32) -> bool {
        match self.peek_next_data_type() {
            Some(DataType::Event) => true,
            Some(DataType::Data) => num_credits > 0,
            None => false,
        }
    }

    /// Resume a consumption that was held (e.g. for alignment).
    fn resume_consumption(&self) {}

    /// Detach this view. Does not release the subpartition's data.
    fn release(&self);

    fn is_released(&self) -> bool;
}

/// In-flight buffers of one subpartition captured for a checkpoint, in
/// queue order.
#[derive(Debug, Default)]
pub struct SubpartitionSnapshot {
    pub buffers: Vec<Buffer>,
}
