//! Exchange wire protocol
//!
//! Handles the length-prefixed framing and the tagged message set exchanged
//! between a consumer's input channel and a producer's data server.
//!
//! Frame format:
//! ```text
//! +------------------+----------------+-------------+------------------+
//! | Length (4 bytes) | Magic (2 bytes)| Tag (1 byte)| Message payload  |
//! +------------------+----------------+-------------+------------------+
//! ```
//!
//! The length prefix counts everything after itself (magic + tag +
//! payload), so every frame is self-describing: a decoder that does not
//! know a tag can still skip the frame. Tags are stable across protocol
//! versions; producer and consumer evolve independently as long as they
//! agree on them.
//!
//! The decoder accumulates partial frames: with insufficient bytes it
//! returns `None` and waits instead of blocking the event loop. A frame
//! arriving in one contiguous chunk is sliced out of the receive buffer
//! without copying; a frame split across deliveries is assembled in the
//! accumulation buffer first. Both paths decode to identical messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use gridflow_core::{DataType, InputChannelId, ResultPartitionId, SubpartitionIndexSet};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{NetworkError, NetworkResult};

/// Magic bytes at the start of every frame, after the length prefix.
pub const FRAME_MAGIC: u16 = 0x47F0;

/// Bytes of magic + tag counted by the length prefix on top of the payload.
const FRAME_OVERHEAD: usize = 3;

/// Maximum frame size (32 MiB). Oversized frames are a protocol violation
/// and connection-fatal.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Message tags. Stable wire contract; never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    PartitionRequest = 0,
    BufferResponse = 1,
    ErrorResponse = 2,
    AddCredit = 3,
    ResumeConsumption = 4,
    NewBufferSize = 5,
    AckAllUserRecordsProcessed = 6,
    CloseRequest = 7,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageTag::PartitionRequest),
            1 => Some(MessageTag::BufferResponse),
            2 => Some(MessageTag::ErrorResponse),
            3 => Some(MessageTag::AddCredit),
            4 => Some(MessageTag::ResumeConsumption),
            5 => Some(MessageTag::NewBufferSize),
            6 => Some(MessageTag::AckAllUserRecordsProcessed),
            7 => Some(MessageTag::CloseRequest),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Structured cause carried by an `ErrorResponse`.
///
/// Causes cross process boundaries as a kind plus a stringified message;
/// the original error object is never reconstructed remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    ProducerFailed = 0,
    PartitionNotFound = 1,
    ProtocolViolation = 2,
    Internal = 3,
}

impl ErrorKind {
    fn from_u8(kind: u8) -> NetworkResult<Self> {
        match kind {
            0 => Ok(ErrorKind::ProducerFailed),
            1 => Ok(ErrorKind::PartitionNotFound),
            2 => Ok(ErrorKind::ProtocolViolation),
            3 => Ok(ErrorKind::Internal),
            _ => Err(NetworkError::Protocol(format!("unknown error kind {kind}"))),
        }
    }
}

/// The control and data messages of the exchange protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Consumer opens a read over a set of subpartitions.
    PartitionRequest {
        partition_id: ResultPartitionId,
        subpartitions: SubpartitionIndexSet,
        receiver_id: InputChannelId,
        initial_credit: u32,
    },
    /// One buffer of data or one event, addressed to a receiver.
    BufferResponse {
        receiver_id: InputChannelId,
        sequence_number: u64,
        backlog: i32,
        data_type: DataType,
        is_compressed: bool,
        payload: Bytes,
    },
    /// A failure. `receiver_id == None` is connection-fatal; a concrete id
    /// scopes the failure to that receiver.
    ErrorResponse {
        receiver_id: Option<InputChannelId>,
        kind: ErrorKind,
        message: String,
    },
    /// Consumer grants the producer more data-buffer credit.
    AddCredit { receiver_id: InputChannelId, credit: u32 },
    /// Consumer resumes a held reader.
    ResumeConsumption { receiver_id: InputChannelId },
    /// Advisory announcement of the consumer's preferred buffer size.
    NewBufferSize { receiver_id: InputChannelId, size: u32 },
    /// Consumer processed all user records of this receiver's stream.
    AckAllUserRecordsProcessed { receiver_id: InputChannelId },
    /// Consumer tears down one receiver.
    CloseRequest { receiver_id: InputChannelId },
}

impl Message {
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::PartitionRequest { .. } => MessageTag::PartitionRequest,
            Message::BufferResponse { .. } => MessageTag::BufferResponse,
            Message::ErrorResponse { .. } => MessageTag::ErrorResponse,
            Message::AddCredit { .. } => MessageTag::AddCredit,
            Message::ResumeConsumption { .. } => MessageTag::ResumeConsumption,
            Message::NewBufferSize { .. } => MessageTag::NewBufferSize,
            Message::AckAllUserRecordsProcessed { .. } => MessageTag::AckAllUserRecordsProcessed,
            Message::CloseRequest { .. } => MessageTag::CloseRequest,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::PartitionRequest {
                partition_id,
                subpartitions,
                receiver_id,
                initial_credit,
            } => {
                buf.put_slice(partition_id.as_bytes());
                buf.put_u32(subpartitions.start());
                buf.put_u32(subpartitions.end());
                buf.put_slice(receiver_id.as_bytes());
                buf.put_u32(*initial_credit);
            }
            Message::BufferResponse {
                receiver_id,
                sequence_number,
                backlog,
                data_type,
                is_compressed,
                payload,
            } => {
                buf.put_slice(receiver_id.as_bytes());
                buf.put_u64(*sequence_number);
                buf.put_i32(*backlog);
                buf.put_u8(data_type.as_u8());
                buf.put_u8(*is_compressed as u8);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Message::ErrorResponse {
                receiver_id,
                kind,
                message,
            } => {
                match receiver_id {
                    Some(id) => {
                        buf.put_u8(1);
                        buf.put_slice(id.as_bytes());
                    }
                    None => buf.put_u8(0),
                }
                buf.put_u8(*kind as u8);
                buf.put_u32(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
            Message::AddCredit {
                receiver_id,
                credit,
            } => {
                buf.put_slice(receiver_id.as_bytes());
                buf.put_u32(*credit);
            }
            Message::ResumeConsumption { receiver_id }
            | Message::AckAllUserRecordsProcessed { receiver_id }
            | Message::CloseRequest { receiver_id } => {
                buf.put_slice(receiver_id.as_bytes());
            }
            Message::NewBufferSize { receiver_id, size } => {
                buf.put_slice(receiver_id.as_bytes());
                buf.put_u32(*size);
            }
        }
    }

    fn decode_body(tag: MessageTag, frame: &mut BytesMut) -> NetworkResult<Message> {
        let message = match tag {
            MessageTag::PartitionRequest => {
                let partition_id = ResultPartitionId::from_bytes(take_id(frame)?);
                let start = take_u32(frame)?;
                let end = take_u32(frame)?;
                if start > end {
                    return Err(NetworkError::Protocol(format!(
                        "empty subpartition index set {start}..{end}"
                    )));
                }
                Message::PartitionRequest {
                    partition_id,
                    subpartitions: SubpartitionIndexSet::range(start, end),
                    receiver_id: InputChannelId::from_bytes(take_id(frame)?),
                    initial_credit: take_u32(frame)?,
                }
            }
            MessageTag::BufferResponse => {
                let receiver_id = InputChannelId::from_bytes(take_id(frame)?);
                let sequence_number = take_u64(frame)?;
                let backlog = take_u32(frame)? as i32;
                let data_type = DataType::try_from(take_u8(frame)?)
                    .map_err(|e| NetworkError::Protocol(e.to_string()))?;
                let is_compressed = take_u8(frame)? != 0;
                let size = take_u32(frame)? as usize;
                if frame.len() != size {
                    return Err(NetworkError::Protocol(format!(
                        "buffer size {size} does not match remaining frame {}",
                        frame.len()
                    )));
                }
                // Zero-copy: the payload is a slice of the receive buffer.
                let payload = frame.split_to(size).freeze();
                Message::BufferResponse {
                    receiver_id,
                    sequence_number,
                    backlog,
                    data_type,
                    is_compressed,
                    payload,
                }
            }
            MessageTag::ErrorResponse => {
                let receiver_id = match take_u8(frame)? {
                    0 => None,
                    _ => Some(InputChannelId::from_bytes(take_id(frame)?)),
                };
                let kind = ErrorKind::from_u8(take_u8(frame)?)?;
                let len = take_u32(frame)? as usize;
                if frame.len() < len {
                    return Err(NetworkError::Protocol(
                        "error message truncated".to_string(),
                    ));
                }
                let message = String::from_utf8(frame.split_to(len).to_vec())
                    .map_err(|e| NetworkError::Protocol(format!("invalid UTF-8: {e}")))?;
                Message::ErrorResponse {
                    receiver_id,
                    kind,
                    message,
                }
            }
            MessageTag::AddCredit => Message::AddCredit {
                receiver_id: InputChannelId::from_bytes(take_id(frame)?),
                credit: take_u32(frame)?,
            },
            MessageTag::ResumeConsumption => Message::ResumeConsumption {
                receiver_id: InputChannelId::from_bytes(take_id(frame)?),
            },
            MessageTag::NewBufferSize => Message::NewBufferSize {
                receiver_id: InputChannelId::from_bytes(take_id(frame)?),
                size: take_u32(frame)?,
            },
            MessageTag::AckAllUserRecordsProcessed => Message::AckAllUserRecordsProcessed {
                receiver_id: InputChannelId::from_bytes(take_id(frame)?),
            },
            MessageTag::CloseRequest => Message::CloseRequest {
                receiver_id: InputChannelId::from_bytes(take_id(frame)?),
            },
        };
        Ok(message)
    }
}

fn take_u8(buf: &mut BytesMut) -> NetworkResult<u8> {
    if buf.is_empty() {
        return Err(NetworkError::Protocol("frame truncated".to_string()));
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut BytesMut) -> NetworkResult<u32> {
    if buf.len() < 4 {
        return Err(NetworkError::Protocol("frame truncated".to_string()));
    }
    Ok(buf.get_u32())
}

fn take_u64(buf: &mut BytesMut) -> NetworkResult<u64> {
    if buf.len() < 8 {
        return Err(NetworkError::Protocol("frame truncated".to_string()));
    }
    Ok(buf.get_u64())
}

fn take_id(buf: &mut BytesMut) -> NetworkResult<[u8; 16]> {
    if buf.len() < 16 {
        return Err(NetworkError::Protocol("frame truncated".to_string()));
    }
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    Ok(id)
}

/// Exchange protocol frame codec.
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> NetworkResult<Option<Message>> {
        // Need at least the length prefix.
        if src.len() < 4 {
            return Ok(None);
        }

        let length = (&src[..4]).get_u32() as usize;
        if length > self.max_frame_size {
            return Err(NetworkError::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }
        if length < FRAME_OVERHEAD {
            return Err(NetworkError::Protocol(format!(
                "frame size {length} below minimum"
            )));
        }

        let total = 4 + length;
        if src.len() < total {
            // Accumulate; reserve so the remainder arrives into one buffer.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(length);

        let magic = frame.get_u16();
        if magic != FRAME_MAGIC {
            return Err(NetworkError::Protocol(format!(
                "bad frame magic {magic:#06x}"
            )));
        }
        let raw_tag = frame.get_u8();
        let tag = MessageTag::from_u8(raw_tag)
            .ok_or_else(|| NetworkError::Protocol(format!("unknown message tag {raw_tag}")))?;
        let message = Message::decode_body(tag, &mut frame)?;
        if !frame.is_empty() {
            return Err(NetworkError::Protocol(format!(
                "{} trailing bytes after {:?}",
                frame.len(),
                tag
            )));
        }
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> NetworkResult<()> {
        let mut body = BytesMut::new();
        item.encode_body(&mut body);

        let length = FRAME_OVERHEAD + body.len();
        if length > self.max_frame_size {
            return Err(NetworkError::Protocol(format!(
                "frame size {} exceeds maximum {}",
                length, self.max_frame_size
            )));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u16(FRAME_MAGIC);
        dst.put_u8(item.tag().as_u8());
        dst.extend_from_slice(&body);
        Ok(())
    }
}
