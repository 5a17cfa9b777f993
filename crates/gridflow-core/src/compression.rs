//! Compression codec selection for spilled exchange data.
//!
//! Buffers spilled by bounded-blocking subpartitions may be compressed per
//! buffer with a fast block codec. The codec id travels both in the spill
//! file header and in every `BufferResponse`, so producer and consumer can
//! disagree on configuration without corrupting data.

use serde::{Deserialize, Serialize};

/// Compression applied to individual data buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl Default for Compression {
    fn default() -> Self {
        Compression::None
    }
}

impl TryFrom<u8> for Compression {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(crate::Error::InvalidCompression(value)),
        }
    }
}
