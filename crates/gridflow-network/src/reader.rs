//! Credit-Based View Reader
//!
//! One registered consumer's read state on the producer side: the wrapped
//! subpartition view(s), the credit account, and the per-receiver sequence
//! number.
//!
//! ## Credit accounting
//!
//! - A data buffer is only sent while `credits > 0`, and sending one
//!   decrements the account; credit can never go negative.
//! - Event buffers are exempt: control flow (watermarks, barriers,
//!   end-of-partition) must not stall on data backpressure.
//! - `AddCredit` tops the account up; a reader blocked on credit becomes
//!   active again.
//!
//! ## Sequencing
//!
//! The sequence number increases by exactly 1 per buffer sent to this
//! receiver since the connection was (re)established — events included —
//! so the consumer can detect gaps.
//!
//! ## Fan-in
//!
//! A request spanning several subpartitions drains them one after another
//! behind a single receiver id; each subpartition's own FIFO order is
//! preserved and the sequence number runs on across the seam.

use gridflow_core::{DataType, InputChannelId};
use gridflow_partition::{BufferAndBacklog, SubpartitionView};
use tracing::trace;

use crate::error::NetworkResult;
use crate::message::Message;

/// Lifecycle of a reader inside the partition request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    Active,
    BlockedOnCredit,
    BlockedOnTransport,
    Finished,
    Errored,
}

/// Server-side read state for one receiver.
pub struct CreditBasedViewReader {
    receiver_id: InputChannelId,
    views: Vec<Box<dyn SubpartitionView>>,
    current_view: usize,
    credits: u32,
    sequence_number: u64,
    announced_buffer_size: Option<u32>,
    paused: bool,
    state: ReaderState,
}

impl CreditBasedViewReader {
    pub fn new(
        receiver_id: InputChannelId,
        views: Vec<Box<dyn SubpartitionView>>,
        initial_credit: u32,
    ) -> Self {
        Self {
            receiver_id,
            views,
            current_view: 0,
            credits: initial_credit,
            sequence_number: 0,
            announced_buffer_size: None,
            paused: false,
            state: ReaderState::Created,
        }
    }

    pub fn receiver_id(&self) -> InputChannelId {
        self.receiver_id
    }

    pub fn credits(&self) -> u32 {
        self.credits
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ReaderState::Finished
    }

    pub fn add_credit(&mut self, credit: u32) {
        self.credits = self.credits.saturating_add(credit);
        if self.state == ReaderState::BlockedOnCredit && self.credits > 0 {
            self.state = ReaderState::Active;
        }
    }

    /// Hold the reader (e.g. while the consumer aligns a barrier).
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume after a hold.
    pub fn resume_consumption(&mut self) {
        self.paused = false;
        if let Some(view) = self.views.get(self.current_view) {
            view.resume_consumption();
        }
    }

    /// Advisory buffer-size announcement; last writer wins.
    pub fn notify_new_buffer_size(&mut self, size: u32) {
        self.announced_buffer_size = Some(size);
    }

    pub fn announced_buffer_size(&self) -> Option<u32> {
        self.announced_buffer_size
    }

    pub(crate) fn mark_blocked_on_transport(&mut self) {
        if matches!(self.state, ReaderState::Active | ReaderState::Created) {
            self.state = ReaderState::BlockedOnTransport;
        }
    }

    /// Whether a `next_response` call could produce a message right now.
    pub fn is_available(&self) -> bool {
        if self.paused || matches!(self.state, ReaderState::Finished | ReaderState::Errored) {
            return false;
        }
        let mut index = self.current_view;
        while let Some(view) = self.views.get(index) {
            match view.peek_next_data_type() {
                Some(DataType::Event) => return true,
                Some(DataType::Data) => return self.credits > 0,
                None => {
                    if view.is_released() {
                        // Polling will surface the release as an error.
                        return true;
                    }
                    if view.backlog() == -1 {
                        // Exhausted view; the next one may have data.
                        index += 1;
                        continue;
                    }
                    return false;
                }
            }
        }
        false
    }

    /// Pull at most one buffer, respecting credit, and wrap it as a
    /// `BufferResponse`.
    pub fn next_response(&mut self) -> NetworkResult<Option<Message>> {
        if self.paused || matches!(self.state, ReaderState::Finished | ReaderState::Errored) {
            return Ok(None);
        }
        loop {
            let Some(view) = self.views.get(self.current_view) else {
                self.state = ReaderState::Finished;
                return Ok(None);
            };
            match view.peek_next_data_type() {
                Some(DataType::Data) if self.credits == 0 => {
                    self.state = ReaderState::BlockedOnCredit;
                    return Ok(None);
                }
                Some(_) => {}
                None => {
                    if view.is_released() {
                        self.state = ReaderState::Errored;
                        return Err(gridflow_partition::Error::PartitionReleased.into());
                    }
                    if view.backlog() == -1 {
                        view.release();
                        self.current_view += 1;
                        continue;
                    }
                    return Ok(None);
                }
            }
            let polled = match view.poll_buffer() {
                Ok(polled) => polled,
                Err(e) => {
                    self.state = ReaderState::Errored;
                    return Err(e.into());
                }
            };
            let Some(BufferAndBacklog {
                buffer, backlog, ..
            }) = polled
            else {
                return Ok(None);
            };
            if buffer.is_data() {
                // Checked above; the account never goes negative.
                self.credits -= 1;
            }
            let sequence_number = self.sequence_number;
            self.sequence_number += 1;
            self.state = ReaderState::Active;
            // The end-of-partition event is the last buffer of a view; move
            // on so the reader finishes once every view is drained.
            if buffer.is_event()
                && matches!(buffer.event_kind(), Ok(gridflow_core::EventKind::EndOfPartition))
            {
                view.release();
                self.current_view += 1;
                if self.current_view >= self.views.len() {
                    self.state = ReaderState::Finished;
                }
            }
            trace!(
                receiver = %self.receiver_id,
                sequence_number,
                backlog,
                "sending buffer"
            );
            return Ok(Some(Message::BufferResponse {
                receiver_id: self.receiver_id,
                sequence_number,
                backlog: backlog as i32,
                data_type: buffer.data_type(),
                is_compressed: buffer.is_compressed(),
                payload: buffer.bytes().clone(),
            }));
        }
    }

    /// Release all wrapped views.
    pub fn release(&mut self) {
        for view in &self.views {
            view.release();
        }
    }
}
