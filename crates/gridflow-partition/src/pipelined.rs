//! Pipelined Subpartition - In-Memory Streaming Exchange
//!
//! The low-latency subpartition variant: an ordered in-memory queue of
//! `BufferConsumer`s, consumed by exactly one read view while the producer
//! is still appending.
//!
//! ## Algorithm
//!
//! - `add` is O(1): the consumer is pushed while its page may still be
//!   filling. The reader polls the same queue slot again later and picks up
//!   whatever was newly written — becoming readable never requires the
//!   consumer to re-request anything.
//! - A buffer only counts towards the backlog once it is finished; the
//!   backlog lives in an atomic so `buffers_in_backlog` never takes the
//!   queue lock.
//! - `flush` trades throughput for latency: it marks the queue so the
//!   in-progress buffer is delivered without waiting for it to fill. The
//!   flag clears once the queue drains.
//!
//! ## Checkpointing
//!
//! `snapshot_state` captures the unread finished buffers in queue order.
//! This module does not interpret record boundaries; the producer finishes
//! its current builder at a record boundary before snapshotting, which is
//! what makes the captured prefix record-aligned.
//!
//! ## Threads
//!
//! One producer appends; one view polls. Both go through the internal
//! mutex; availability callbacks are invoked strictly outside it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use gridflow_core::{BufferConsumer, DataType, EventKind, ResultPartitionId};
use tracing::debug;

use crate::error::{Error, Result};
use crate::view::{
    BufferAndBacklog, BufferAvailabilityListener, SubpartitionSnapshot, SubpartitionView,
};

struct QueueEntry {
    consumer: BufferConsumer,
    /// Bytes at the start of this buffer that belong to a record begun in
    /// the previous buffer.
    #[allow(dead_code)]
    partial_record_length: usize,
}

struct Inner {
    queue: VecDeque<QueueEntry>,
    flush_requested: bool,
    finished: bool,
    released: bool,
    view_active: bool,
    listener: Option<Arc<dyn BufferAvailabilityListener>>,
    total_buffers: u64,
    total_bytes: u64,
}

/// In-memory subpartition for pipelined (streaming) exchanges.
pub struct PipelinedSubpartition {
    parent: ResultPartitionId,
    index: u32,
    inner: Mutex<Inner>,
    /// Finished, undelivered data buffers; `-1` once exhausted.
    backlog: AtomicI64,
}

impl PipelinedSubpartition {
    pub fn new(parent: ResultPartitionId, index: u32) -> Self {
        Self {
            parent,
            index,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                flush_requested: false,
                finished: false,
                released: false,
                view_active: false,
                listener: None,
                total_buffers: 0,
                total_bytes: 0,
            }),
            backlog: AtomicI64::new(0),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Append a buffer consumer. Producer thread only.
    pub fn add(&self, consumer: BufferConsumer, partial_record_length: usize) -> Result<()> {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            if inner.released {
                return Err(Error::PartitionReleased);
            }
            if inner.finished {
                return Err(Error::AddAfterFinish);
            }
            let notify = consumer.is_finished() || inner.flush_requested;
            inner.queue.push_back(QueueEntry {
                consumer,
                partial_record_length,
            });
            self.update_backlog(&inner);
            if notify {
                inner.listener.clone()
            } else {
                None
            }
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
        Ok(())
    }

    /// Called when the producer finishes the builder of an already-enqueued
    /// consumer, making that buffer deliverable without a flush.
    pub fn on_buffer_finished(&self) {
        let listener = {
            let inner = self.inner.lock().unwrap();
            if inner.released {
                return;
            }
            self.update_backlog(&inner);
            inner.listener.clone()
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// Force delivery of the current in-progress buffer.
    ///
    /// Re-flushing after more bytes were appended notifies the reader
    /// again, so low-latency configurations can flush per record.
    pub fn flush(&self) {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            if inner.released || inner.queue.is_empty() {
                None
            } else {
                inner.flush_requested = true;
                let readable = inner
                    .queue
                    .front()
                    .map(|e| e.consumer.is_data_available() || e.consumer.is_finished())
                    .unwrap_or(false);
                if readable {
                    inner.listener.clone()
                } else {
                    None
                }
            }
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// Mark the subpartition finished and enqueue the end-of-partition
    /// event. Idempotent.
    pub fn finish(&self) -> Result<()> {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            if inner.released {
                return Err(Error::PartitionReleased);
            }
            if inner.finished {
                return Ok(());
            }
            inner
                .queue
                .push_back(QueueEntry {
                    consumer: BufferConsumer::from_event(EventKind::EndOfPartition),
                    partial_record_length: 0,
                });
            inner.finished = true;
            self.update_backlog(&inner);
            inner.listener.clone()
        };
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
        Ok(())
    }

    /// Drop all queued buffers and fail subsequent operations. Idempotent.
    pub fn release(&self) {
        let listener = {
            let mut inner = self.inner.lock().unwrap();
            if inner.released {
                return;
            }
            debug!(partition = %self.parent, index = self.index, "releasing pipelined subpartition");
            inner.released = true;
            inner.queue.clear();
            self.backlog.store(-1, Ordering::Release);
            inner.listener.take()
        };
        // Wake the consumer so it observes the release instead of waiting.
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap().released
    }

    /// Create the single read view. A view released earlier (e.g. consumer
    /// reconnect) may be replaced.
    pub fn create_read_view(
        self: &Arc<Self>,
        listener: Arc<dyn BufferAvailabilityListener>,
    ) -> Result<PipelinedSubpartitionView> {
        let notify_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.released {
                return Err(Error::PartitionReleased);
            }
            if inner.view_active {
                return Err(Error::ViewAlreadyCreated);
            }
            inner.view_active = true;
            inner.listener = Some(listener.clone());
            !inner.queue.is_empty()
        };
        if notify_now {
            listener.notify_data_available();
        }
        Ok(PipelinedSubpartitionView {
            parent: self.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Finished data buffers waiting to be delivered.
    pub fn buffers_in_backlog(&self) -> i64 {
        self.backlog.load(Ordering::Acquire)
    }

    /// Buffers and bytes handed to the reader so far.
    pub fn consumed_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.total_buffers, inner.total_bytes)
    }

    /// Capture unread finished buffers in queue order for a checkpoint.
    pub fn snapshot_state(&self, _checkpoint_id: u64) -> SubpartitionSnapshot {
        let inner = self.inner.lock().unwrap();
        let buffers = inner
            .queue
            .iter()
            .filter(|e| e.consumer.is_finished() && e.consumer.data_type() == DataType::Data)
            .filter_map(|e| e.consumer.snapshot())
            .collect();
        SubpartitionSnapshot { buffers }
    }

    fn update_backlog(&self, inner: &Inner) {
        let value = if inner.finished && inner.queue.is_empty() {
            -1
        } else {
            inner
                .queue
                .iter()
                .filter(|e| {
                    e.consumer.data_type() == DataType::Data
                        && e.consumer.is_finished()
                        && !e.consumer.is_consumed()
                })
                .count() as i64
        };
        self.backlog.store(value, Ordering::Release);
    }

    fn poll_buffer(&self) -> Result<Option<BufferAndBacklog>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.released {
            return Err(Error::PartitionReleased);
        }
        loop {
            let flush_requested = inner.flush_requested;
            let Some(entry) = inner.queue.front_mut() else {
                inner.flush_requested = false;
                return Ok(None);
            };
            let is_finished = entry.consumer.is_finished();
            if !is_finished && !flush_requested {
                return Ok(None);
            }
            let maybe_buffer = entry.consumer.build();
            let consumed = entry.consumer.is_consumed();
            if consumed {
                inner.queue.pop_front();
            }
            match maybe_buffer {
                Some(buffer) => {
                    inner.total_buffers += 1;
                    inner.total_bytes += buffer.len() as u64;
                    if inner.queue.is_empty() {
                        inner.flush_requested = false;
                    }
                    self.update_backlog(&inner);
                    // `-1` on the final buffer tells the consumer the
                    // subpartition is exhausted.
                    let backlog = self.backlog.load(Ordering::Acquire);
                    let next_data_type = self.peek_locked(&inner);
                    return Ok(Some(BufferAndBacklog {
                        buffer,
                        backlog,
                        next_data_type,
                    }));
                }
                None if consumed => {
                    // Empty finished buffer, nothing to deliver; keep going.
                    continue;
                }
                None => return Ok(None),
            }
        }
    }

    fn peek_locked(&self, inner: &Inner) -> Option<DataType> {
        for entry in &inner.queue {
            let finished = entry.consumer.is_finished();
            if entry.consumer.is_data_available() {
                if finished || inner.flush_requested {
                    return Some(entry.consumer.data_type());
                }
                return None;
            }
            if finished {
                // Empty finished buffer is skipped by poll.
                continue;
            }
            return None;
        }
        None
    }

    fn on_view_released(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.view_active = false;
        inner.listener = None;
    }
}

/// The single read cursor of a pipelined subpartition.
pub struct PipelinedSubpartitionView {
    parent: Arc<PipelinedSubpartition>,
    released: AtomicBool,
}

impl SubpartitionView for PipelinedSubpartitionView {
    fn poll_buffer(&self) -> Result<Option<BufferAndBacklog>> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::PartitionReleased);
        }
        self.parent.poll_buffer()
    }

    fn backlog(&self) -> i64 {
        self.parent.buffers_in_backlog()
    }

    fn peek_next_data_type(&self) -> Option<DataType> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        let inner = self.parent.inner.lock().unwrap();
        if inner.released {
            return None;
        }
        self.parent.peek_locked(&inner)
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.parent.on_view_released();
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.parent.is_released()
    }
}
