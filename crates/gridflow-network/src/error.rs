//! Network protocol error handling
//!
//! Distinguishes receiver-scoped failures (one consumer's request went
//! wrong, the connection stays up) from connection-fatal failures
//! (protocol violations, IO errors). The mapping to wire-level
//! `ErrorResponse` kinds lives here so the server and the request queue
//! agree on scoping.

use gridflow_core::ResultPartitionId;
use thiserror::Error;

use crate::message::ErrorKind;

pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Partition not found: {0}")]
    PartitionNotFound(ResultPartitionId),

    #[error("Producer failed: {0}")]
    ProducerFailed(String),

    #[error("Partition error: {0}")]
    Partition(#[from] gridflow_partition::Error),
}

impl NetworkError {
    /// Wire-level kind used when reporting this error to a consumer.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            NetworkError::Protocol(_) => ErrorKind::ProtocolViolation,
            NetworkError::PartitionNotFound(_) => ErrorKind::PartitionNotFound,
            NetworkError::ProducerFailed(_) => ErrorKind::ProducerFailed,
            NetworkError::Partition(gridflow_partition::Error::PartitionReleased) => {
                ErrorKind::PartitionNotFound
            }
            NetworkError::Partition(_) => ErrorKind::ProducerFailed,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether this error must tear down the whole connection rather than a
    /// single receiver.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            NetworkError::Io(_) | NetworkError::Protocol(_) | NetworkError::ConnectionClosed
        )
    }
}
