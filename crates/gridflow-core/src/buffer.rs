//! Buffers, Builders, and Consumers
//!
//! The exchange layer moves data as `Buffer`s: immutable, reference-counted
//! views over a memory page plus metadata (data vs. event, compressed flag).
//!
//! ## Lifecycle
//!
//! 1. A producer obtains a `BufferBuilder` from the [`BufferPool`]
//! 2. It appends serialized record bytes; a `BufferConsumer` created from the
//!    builder is enqueued in a subpartition at the same time
//! 3. Readers poll the consumer, which snapshots whatever is readable at that
//!    moment — a buffer still being written can be drained early on flush
//! 4. `finish()` seals the page; the consumer hands out the remaining bytes
//!    zero-copy
//! 5. When the last handle (builder, consumer, or any `Buffer` clone) drops,
//!    the page's pool permit is released exactly once
//!
//! ## Invariants
//!
//! - `0 <= read position <= written <= page capacity` at all times
//! - a finished page never grows again (`finish` consumes the builder)
//! - event buffers are never pooled and never compressed
//!
//! [`BufferPool`]: crate::pool::BufferPool

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pool::PoolPermit;

/// Whether a buffer carries records or a control event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Data = 0,
    Event = 1,
}

impl DataType {
    pub fn is_event(self) -> bool {
        matches!(self, DataType::Event)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(DataType::Data),
            1 => Ok(DataType::Event),
            _ => Err(Error::InvalidBuffer(format!("unknown data type {value}"))),
        }
    }
}

/// Control events carried in-band through subpartition queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The producing task finished this partition; no further buffers follow.
    EndOfPartition,
    /// The producer has emitted all user records. `drain` distinguishes a
    /// draining stop from a suspend.
    EndOfData { drain: bool },
}

impl EventKind {
    pub fn to_payload(self) -> Bytes {
        match self {
            EventKind::EndOfPartition => Bytes::from_static(&[0]),
            EventKind::EndOfData { drain: true } => Bytes::from_static(&[1, 1]),
            EventKind::EndOfData { drain: false } => Bytes::from_static(&[1, 0]),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload {
            [0] => Ok(EventKind::EndOfPartition),
            [1, d] => Ok(EventKind::EndOfData { drain: *d != 0 }),
            _ => Err(Error::InvalidBuffer("unknown event payload".to_string())),
        }
    }
}

/// An immutable, cheaply cloneable chunk of exchange data.
///
/// Cloning shares the payload and the pool permit; the permit is released
/// when the last clone (and the originating consumer/builder) drops.
#[derive(Clone)]
pub struct Buffer {
    data: Bytes,
    data_type: DataType,
    is_compressed: bool,
    permit: Option<Arc<PoolPermit>>,
}

impl Buffer {
    /// Wrap bytes that did not come from a pool (network receive, tests).
    pub fn from_bytes(data: Bytes, data_type: DataType, is_compressed: bool) -> Self {
        Self {
            data,
            data_type,
            is_compressed,
            permit: None,
        }
    }

    /// An event buffer. Events are unpooled and uncompressed.
    pub fn event(kind: EventKind) -> Self {
        Self {
            data: kind.to_payload(),
            data_type: DataType::Event,
            is_compressed: false,
            permit: None,
        }
    }

    pub(crate) fn pooled(data: Bytes, data_type: DataType, permit: Arc<PoolPermit>) -> Self {
        Self {
            data,
            data_type,
            is_compressed: false,
            permit: Some(permit),
        }
    }

    /// Replace the payload (e.g. with its compressed form), keeping the pool
    /// accounting of the original page alive.
    pub fn with_payload(self, data: Bytes, is_compressed: bool) -> Self {
        Self {
            data,
            data_type: self.data_type,
            is_compressed,
            permit: self.permit,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_event(&self) -> bool {
        self.data_type.is_event()
    }

    pub fn is_data(&self) -> bool {
        !self.is_event()
    }

    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    /// Parse the event kind of an event buffer.
    pub fn event_kind(&self) -> Result<EventKind> {
        if !self.is_event() {
            return Err(Error::InvalidBuffer(
                "not an event buffer".to_string(),
            ));
        }
        EventKind::from_payload(&self.data)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("data_type", &self.data_type)
            .field("is_compressed", &self.is_compressed)
            .field("pooled", &self.permit.is_some())
            .finish()
    }
}

/// Page state shared between one builder and its consumer.
struct PageState {
    page: BytesMut,
    finished: bool,
    /// Set once, at finish; consumers slice it zero-copy afterwards.
    frozen: Option<Bytes>,
}

impl PageState {
    fn written(&self) -> usize {
        match &self.frozen {
            Some(frozen) => frozen.len(),
            None => self.page.len(),
        }
    }
}

/// Producer-side write cursor over one pooled page.
pub struct BufferBuilder {
    shared: Arc<Mutex<PageState>>,
    capacity: usize,
    permit: Arc<PoolPermit>,
}

impl BufferBuilder {
    pub(crate) fn new(capacity: usize, permit: Arc<PoolPermit>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(PageState {
                page: BytesMut::with_capacity(capacity),
                finished: false,
                frozen: None,
            })),
            capacity,
            permit,
        }
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub fn append(&self, src: &[u8]) -> usize {
        let mut state = self.shared.lock().unwrap();
        let room = self.capacity - state.page.len();
        let n = room.min(src.len());
        state.page.extend_from_slice(&src[..n]);
        n
    }

    pub fn written(&self) -> usize {
        self.shared.lock().unwrap().written()
    }

    pub fn is_full(&self) -> bool {
        self.written() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Seal the page. No further writes are possible; the paired consumer
    /// serves the remaining bytes zero-copy. Returns the final size.
    pub fn finish(self) -> usize {
        let mut state = self.shared.lock().unwrap();
        let frozen = state.page.split().freeze();
        let len = frozen.len();
        state.frozen = Some(frozen);
        state.finished = true;
        len
    }

    /// A consumer reading this page while it is still being written.
    pub fn create_consumer(&self) -> BufferConsumer {
        BufferConsumer {
            shared: self.shared.clone(),
            read_pos: 0,
            data_type: DataType::Data,
            permit: Some(self.permit.clone()),
        }
    }
}

/// Reader-side cursor over a page that may still be growing.
pub struct BufferConsumer {
    shared: Arc<Mutex<PageState>>,
    read_pos: usize,
    data_type: DataType,
    permit: Option<Arc<PoolPermit>>,
}

impl BufferConsumer {
    /// A consumer over an already-complete event.
    pub fn from_event(kind: EventKind) -> Self {
        Self::from_buffer(Buffer::event(kind))
    }

    /// Wrap a complete buffer (finished from the start).
    pub fn from_buffer(buffer: Buffer) -> Self {
        let data_type = buffer.data_type();
        let permit = buffer.permit.clone();
        Self {
            shared: Arc::new(Mutex::new(PageState {
                page: BytesMut::new(),
                finished: true,
                frozen: Some(buffer.data),
            })),
            read_pos: 0,
            data_type,
            permit,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Bytes written but not yet handed out through `build`.
    pub fn readable_bytes(&self) -> usize {
        self.shared.lock().unwrap().written() - self.read_pos
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().unwrap().finished
    }

    /// Finished and fully read.
    pub fn is_consumed(&self) -> bool {
        let state = self.shared.lock().unwrap();
        state.finished && self.read_pos == state.written()
    }

    pub fn is_data_available(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Like [`build`](Self::build), but does not advance the read cursor.
    ///
    /// Used by checkpoint snapshots to capture in-flight data without
    /// consuming it.
    pub fn snapshot(&self) -> Option<Buffer> {
        let state = self.shared.lock().unwrap();
        let written = state.written();
        if written == self.read_pos {
            return None;
        }
        let data = match &state.frozen {
            Some(frozen) => frozen.slice(self.read_pos..written),
            None => Bytes::copy_from_slice(&state.page[self.read_pos..written]),
        };
        Some(match &self.permit {
            Some(permit) => Buffer::pooled(data, self.data_type, permit.clone()),
            None => Buffer::from_bytes(data, self.data_type, false),
        })
    }

    /// Snapshot the currently readable bytes as a `Buffer`.
    ///
    /// For a finished page the result references the page zero-copy; for a
    /// page still being written the readable prefix is copied out so the
    /// producer can keep appending. Returns `None` when nothing is readable.
    pub fn build(&mut self) -> Option<Buffer> {
        let state = self.shared.lock().unwrap();
        let written = state.written();
        if written == self.read_pos {
            return None;
        }
        let data = match &state.frozen {
            Some(frozen) => frozen.slice(self.read_pos..written),
            None => Bytes::copy_from_slice(&state.page[self.read_pos..written]),
        };
        drop(state);
        self.read_pos = written;
        Some(match &self.permit {
            Some(permit) => Buffer::pooled(data, self.data_type, permit.clone()),
            None => Buffer::from_bytes(data, self.data_type, false),
        })
    }
}

impl std::fmt::Debug for BufferConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferConsumer")
            .field("data_type", &self.data_type)
            .field("read_pos", &self.read_pos)
            .field("finished", &self.is_finished())
            .finish()
    }
}
