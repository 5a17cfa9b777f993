//! Partition Request Queue
//!
//! Server-side multiplexer that fairly drains many view readers onto one
//! outbound transport connection.
//!
//! ## Drain algorithm
//!
//! Readers that signalled "data available" sit in a FIFO work set. Each
//! drain turn pops one reader, pulls at most one buffer from its view
//! (respecting credit), and re-enqueues the reader if it still has data and
//! credit. One buffer per turn keeps a single busy reader from starving the
//! others.
//!
//! When the transport reports unwritable, the drain stops immediately and
//! resumes on the next writability transition — buffers stay queued in the
//! subpartitions instead of piling up here, which is the whole point of
//! credit-based flow control.
//!
//! ## Error scoping
//!
//! A reader whose partition disappeared produces an `ErrorResponse` scoped
//! to its receiver id and is dropped from the queue; the connection and all
//! other readers stay up. Connection-fatal conditions are the transport's
//! business, not this queue's.

use std::collections::{HashMap, HashSet, VecDeque};

use gridflow_core::InputChannelId;
use tracing::debug;

use crate::error::NetworkResult;
use crate::message::Message;
use crate::reader::CreditBasedViewReader;

/// FIFO multiplexer over the readers registered on one connection.
#[derive(Default)]
pub struct PartitionRequestQueue {
    readers: HashMap<InputChannelId, CreditBasedViewReader>,
    available: VecDeque<InputChannelId>,
    enqueued: HashSet<InputChannelId>,
    transport_writable: bool,
}

impl PartitionRequestQueue {
    pub fn new() -> Self {
        Self {
            readers: HashMap::new(),
            available: VecDeque::new(),
            enqueued: HashSet::new(),
            transport_writable: true,
        }
    }

    pub fn num_readers(&self) -> usize {
        self.readers.len()
    }

    pub fn reader(&self, receiver_id: &InputChannelId) -> Option<&CreditBasedViewReader> {
        self.readers.get(receiver_id)
    }

    /// Register a reader created for a `PartitionRequest`.
    pub fn register(&mut self, reader: CreditBasedViewReader) {
        let receiver_id = reader.receiver_id();
        let available = reader.is_available();
        self.readers.insert(receiver_id, reader);
        if available {
            self.enqueue(receiver_id);
        }
    }

    /// A subpartition view signalled "has data" for this receiver.
    pub fn notify_data_available(&mut self, receiver_id: InputChannelId) {
        let available = self
            .readers
            .get(&receiver_id)
            .map(|reader| reader.is_available())
            .unwrap_or(false);
        if available {
            self.enqueue(receiver_id);
        }
    }

    pub fn add_credit(&mut self, receiver_id: InputChannelId, credit: u32) {
        let available = match self.readers.get_mut(&receiver_id) {
            Some(reader) => {
                reader.add_credit(credit);
                reader.is_available()
            }
            None => {
                debug!(receiver = %receiver_id, "credit for unknown receiver dropped");
                false
            }
        };
        if available {
            self.enqueue(receiver_id);
        }
    }

    pub fn resume_consumption(&mut self, receiver_id: InputChannelId) {
        let available = match self.readers.get_mut(&receiver_id) {
            Some(reader) => {
                reader.resume_consumption();
                reader.is_available()
            }
            None => false,
        };
        if available {
            self.enqueue(receiver_id);
        }
    }

    /// Advisory; an announcement racing reader creation is dropped
    /// silently — last writer wins, nothing is buffered.
    pub fn notify_new_buffer_size(&mut self, receiver_id: InputChannelId, size: u32) {
        if let Some(reader) = self.readers.get_mut(&receiver_id) {
            reader.notify_new_buffer_size(size);
        }
    }

    /// Tear down one receiver; its views are released.
    pub fn close_receiver(&mut self, receiver_id: InputChannelId) {
        if let Some(mut reader) = self.readers.remove(&receiver_id) {
            reader.release();
        }
        self.enqueued.remove(&receiver_id);
    }

    /// Transport writability transition driving the drain loop.
    pub fn set_transport_writable(&mut self, writable: bool) {
        self.transport_writable = writable;
        if !writable {
            for id in &self.available {
                if let Some(reader) = self.readers.get_mut(id) {
                    reader.mark_blocked_on_transport();
                }
            }
        }
    }

    pub fn has_available(&self) -> bool {
        self.transport_writable && !self.available.is_empty()
    }

    /// One drain turn: pop a ready reader, pull one buffer, re-enqueue the
    /// reader if it can make further progress. Reader failures come back as
    /// receiver-scoped `ErrorResponse`s.
    pub fn poll_next(&mut self) -> NetworkResult<Option<Message>> {
        while self.transport_writable {
            let Some(receiver_id) = self.available.pop_front() else {
                return Ok(None);
            };
            self.enqueued.remove(&receiver_id);
            let Some(reader) = self.readers.get_mut(&receiver_id) else {
                continue;
            };
            let result = reader.next_response();
            let finished = reader.is_finished();
            let available = reader.is_available();
            match result {
                Ok(Some(message)) => {
                    if finished {
                        debug!(receiver = %receiver_id, "reader finished");
                        self.close_receiver(receiver_id);
                    } else if available {
                        self.enqueue(receiver_id);
                    }
                    return Ok(Some(message));
                }
                Ok(None) => {
                    if finished {
                        self.close_receiver(receiver_id);
                    }
                    continue;
                }
                Err(e) => {
                    let kind = e.error_kind();
                    let message = e.to_string();
                    debug!(receiver = %receiver_id, error = %message, "reader failed, scoping error");
                    self.close_receiver(receiver_id);
                    return Ok(Some(Message::ErrorResponse {
                        receiver_id: Some(receiver_id),
                        kind,
                        message,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Release every reader (connection teardown).
    pub fn release_all(&mut self) {
        for (_, mut reader) in self.readers.drain() {
            reader.release();
        }
        self.available.clear();
        self.enqueued.clear();
    }

    fn enqueue(&mut self, receiver_id: InputChannelId) {
        if self.enqueued.insert(receiver_id) {
            self.available.push_back(receiver_id);
        }
    }
}

impl Drop for PartitionRequestQueue {
    fn drop(&mut self) {
        self.release_all();
    }
}
