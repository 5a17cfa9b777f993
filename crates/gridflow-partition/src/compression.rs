//! Per-Buffer Compression for the Spill Path
//!
//! Bounded-blocking subpartitions may compress each data buffer before it is
//! written to disk. Compression never runs on the pipelined hot path, and
//! decompression is lazy: buffers travel compressed (on disk and on the
//! wire) and are expanded only where they are consumed.
//!
//! A buffer whose compressed form is not smaller than the original is
//! written uncompressed and keeps `is_compressed == false`, so the reader
//! never pays for a pointless round-trip. Event buffers are never
//! compressed.

use gridflow_core::{Buffer, Compression, Error};

use crate::error::Result;

/// Compresses data buffers with the configured codec.
#[derive(Debug, Clone, Copy)]
pub struct BufferCompressor {
    codec: Compression,
}

impl BufferCompressor {
    pub fn new(codec: Compression) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> Compression {
        self.codec
    }

    /// Compress `buffer` if that makes it smaller; otherwise return it
    /// unchanged.
    pub fn compress_if_smaller(&self, buffer: Buffer) -> Buffer {
        if buffer.is_event() || buffer.is_compressed() || buffer.is_empty() {
            return buffer;
        }
        match self.codec {
            Compression::None => buffer,
            Compression::Lz4 => {
                let compressed = lz4_flex::compress_prepend_size(buffer.bytes());
                if compressed.len() < buffer.len() {
                    buffer.with_payload(compressed.into(), true)
                } else {
                    buffer
                }
            }
        }
    }
}

/// Expand a possibly-compressed buffer. Uncompressed buffers pass through.
pub fn decompress_buffer(buffer: Buffer) -> Result<Buffer> {
    if !buffer.is_compressed() {
        return Ok(buffer);
    }
    let decompressed = lz4_flex::decompress_size_prepended(buffer.bytes())
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(buffer.with_payload(decompressed.into(), false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gridflow_core::{DataType, EventKind};

    fn data_buffer(payload: &'static [u8]) -> Buffer {
        Buffer::from_bytes(Bytes::from_static(payload), DataType::Data, false)
    }

    #[test]
    fn test_compress_roundtrip() {
        let compressor = BufferCompressor::new(Compression::Lz4);
        let original = data_buffer(&[0x42; 4096]);

        let compressed = compressor.compress_if_smaller(original.clone());
        assert!(compressed.is_compressed());
        assert!(compressed.len() < original.len());

        let restored = decompress_buffer(compressed).unwrap();
        assert!(!restored.is_compressed());
        assert_eq!(restored.bytes(), original.bytes());
    }

    #[test]
    fn test_incompressible_buffer_stays_raw() {
        let compressor = BufferCompressor::new(Compression::Lz4);
        // Two bytes of noise cannot shrink past the size prefix.
        let original = data_buffer(&[0xAB, 0x5C]);
        let result = compressor.compress_if_smaller(original.clone());
        assert!(!result.is_compressed());
        assert_eq!(result.bytes(), original.bytes());
    }

    #[test]
    fn test_events_never_compressed() {
        let compressor = BufferCompressor::new(Compression::Lz4);
        let event = Buffer::event(EventKind::EndOfPartition);
        let result = compressor.compress_if_smaller(event);
        assert!(!result.is_compressed());
        assert!(result.is_event());
    }

    #[test]
    fn test_none_codec_is_identity() {
        let compressor = BufferCompressor::new(Compression::None);
        let original = data_buffer(&[0x42; 4096]);
        let result = compressor.compress_if_smaller(original.clone());
        assert!(!result.is_compressed());
        assert_eq!(result.bytes(), original.bytes());
    }

    #[test]
    fn test_decompress_passthrough() {
        let buffer = data_buffer(b"plain");
        let result = decompress_buffer(buffer.clone()).unwrap();
        assert_eq!(result.bytes(), buffer.bytes());
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let bogus = Buffer::from_bytes(Bytes::from_static(&[1, 2, 3]), DataType::Data, true);
        assert!(decompress_buffer(bogus).is_err());
    }
}
