//! Spill file validation and read paths.
//!
//! A sealed spill file is validated once (magic, version, CRC32, index) and
//! then shared read-only by any number of readers. The file-channel path
//! gives every reader its own handle; the memory-mapped path shares one
//! read-only mapping.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes};
use gridflow_core::{Buffer, DataType};
use memmap2::Mmap;

use super::{
    BoundedStorageKind, Region, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, INDEX_ENTRY_SIZE,
    SPILL_MAGIC, SPILL_VERSION,
};
use crate::error::{Error, Result};
use crate::view::{BufferAndBacklog, SubpartitionView};

enum Storage {
    FileChannel { path: PathBuf },
    MemoryMapped { mmap: Arc<Mmap> },
}

/// A validated, immutable spill file.
pub(crate) struct SpillFile {
    regions: Arc<Vec<Region>>,
    total_buffers: u32,
    data_buffers: u32,
    storage: Storage,
}

impl SpillFile {
    /// Open and validate a sealed spill file.
    pub(crate) fn open(path: &Path, kind: BoundedStorageKind) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::InvalidSpillFile("file too small".to_string()));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;
        if header[..4] != SPILL_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = u16::from_be_bytes([header[4], header[5]]);
        if version != SPILL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let footer_start = file_len - FOOTER_SIZE as u64;
        file.seek(SeekFrom::Start(footer_start))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;
        let mut cursor = &footer[..];
        let index_position = cursor.get_u64();
        let region_count = cursor.get_u32() as usize;
        let total_buffers = cursor.get_u32();
        let data_buffers = cursor.get_u32();
        let stored_crc = cursor.get_u32();
        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != SPILL_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let index_len = region_count as u64 * INDEX_ENTRY_SIZE as u64;
        if index_position + index_len != footer_start {
            return Err(Error::InvalidSpillFile(
                "index does not line up with footer".to_string(),
            ));
        }

        // CRC covers header, entries, and index.
        file.seek(SeekFrom::Start(0))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = footer_start;
        let mut chunk = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let n = chunk.len().min(remaining as usize);
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }
        if hasher.finalize() != stored_crc {
            return Err(Error::CrcMismatch);
        }

        file.seek(SeekFrom::Start(index_position))?;
        let mut index_bytes = vec![0u8; index_len as usize];
        file.read_exact(&mut index_bytes)?;
        let mut cursor = &index_bytes[..];
        let mut regions = Vec::with_capacity(region_count);
        for _ in 0..region_count {
            regions.push(Region {
                file_offset: cursor.get_u64(),
                first_buffer: cursor.get_u32(),
                num_buffers: cursor.get_u32(),
            });
        }

        let storage = match kind {
            BoundedStorageKind::FileChannel => Storage::FileChannel {
                path: path.to_path_buf(),
            },
            BoundedStorageKind::MemoryMapped => {
                let file = File::open(path)?;
                // Spill files are process-private and immutable once sealed.
                let mmap = unsafe { Mmap::map(&file)? };
                Storage::MemoryMapped {
                    mmap: Arc::new(mmap),
                }
            }
        };

        Ok(Self {
            regions: Arc::new(regions),
            total_buffers,
            data_buffers,
            storage,
        })
    }

    pub(crate) fn total_buffers(&self) -> u32 {
        self.total_buffers
    }

    pub(crate) fn data_buffers(&self) -> u32 {
        self.data_buffers
    }

    pub(crate) fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// A new independent cursor positioned at the first buffer.
    pub(crate) fn create_reader(&self) -> Result<SpillReader> {
        let source = match &self.storage {
            Storage::FileChannel { path } => {
                let mut reader = BufReader::new(File::open(path)?);
                reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
                ReaderSource::File(reader)
            }
            Storage::MemoryMapped { mmap } => ReaderSource::Mmap {
                mmap: mmap.clone(),
                pos: HEADER_SIZE,
            },
        };
        Ok(SpillReader {
            source,
            regions: self.regions.clone(),
            buffers_read: 0,
            total_buffers: self.total_buffers,
            peeked: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryMeta {
    len: usize,
    pub(crate) data_type: DataType,
    compressed: bool,
}

enum ReaderSource {
    File(BufReader<File>),
    Mmap { mmap: Arc<Mmap>, pos: usize },
}

/// One cursor over a sealed spill file. Regions are crossed transparently;
/// the region index is only consulted for seeks.
pub(crate) struct SpillReader {
    source: ReaderSource,
    regions: Arc<Vec<Region>>,
    buffers_read: u32,
    total_buffers: u32,
    peeked: Option<EntryMeta>,
}

impl SpillReader {
    /// Header of the next entry without consuming it.
    pub(crate) fn peek_meta(&mut self) -> Result<Option<EntryMeta>> {
        if self.peeked.is_none() {
            if self.buffers_read >= self.total_buffers {
                return Ok(None);
            }
            let mut header = [0u8; ENTRY_HEADER_SIZE];
            self.read_exact(&mut header)?;
            let mut cursor = &header[..];
            let len = cursor.get_u32() as usize;
            let data_type = DataType::try_from(cursor.get_u8()).map_err(Error::Core)?;
            let compressed = cursor.get_u8() != 0;
            self.peeked = Some(EntryMeta {
                len,
                data_type,
                compressed,
            });
        }
        Ok(self.peeked)
    }

    /// Decode the next length-prefixed buffer; `None` at end-of-stream.
    pub(crate) fn next_buffer(&mut self) -> Result<Option<Buffer>> {
        let Some(meta) = self.peek_meta()? else {
            return Ok(None);
        };
        let payload = match &mut self.source {
            ReaderSource::File(reader) => {
                let mut payload = vec![0u8; meta.len];
                reader.read_exact(&mut payload)?;
                Bytes::from(payload)
            }
            ReaderSource::Mmap { mmap, pos } => {
                let end = *pos + meta.len;
                if end > mmap.len() {
                    return Err(Error::InvalidSpillFile(
                        "entry extends past end of mapping".to_string(),
                    ));
                }
                let payload = Bytes::copy_from_slice(&mmap[*pos..end]);
                *pos = end;
                payload
            }
        };
        self.peeked = None;
        self.buffers_read += 1;
        Ok(Some(Buffer::from_bytes(payload, meta.data_type, meta.compressed)))
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.peeked.is_none() && self.buffers_read >= self.total_buffers
    }

    /// Position the cursor at buffer `target` using the region index: one
    /// index lookup, then header skips inside the region only.
    pub(crate) fn seek_to_buffer(&mut self, target: u32) -> Result<()> {
        if target > self.total_buffers {
            return Err(Error::InvalidSpillFile(format!(
                "seek target {target} past end ({} buffers)",
                self.total_buffers
            )));
        }
        let region_idx = self
            .regions
            .partition_point(|r| r.first_buffer <= target)
            .saturating_sub(1);
        let region = self.regions.get(region_idx).copied().unwrap_or(Region {
            file_offset: HEADER_SIZE as u64,
            first_buffer: 0,
            num_buffers: 0,
        });

        self.peeked = None;
        self.buffers_read = region.first_buffer;
        match &mut self.source {
            ReaderSource::File(reader) => {
                reader.seek(SeekFrom::Start(region.file_offset))?;
            }
            ReaderSource::Mmap { pos, .. } => {
                *pos = region.file_offset as usize;
            }
        }

        while self.buffers_read < target {
            let Some(meta) = self.peek_meta()? else { break };
            match &mut self.source {
                ReaderSource::File(reader) => {
                    reader.seek_relative(meta.len as i64)?;
                }
                ReaderSource::Mmap { pos, .. } => {
                    *pos += meta.len;
                }
            }
            self.peeked = None;
            self.buffers_read += 1;
        }
        Ok(())
    }
}

impl Read for SpillReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.source {
            ReaderSource::File(reader) => reader.read(buf),
            ReaderSource::Mmap { mmap, pos } => {
                let remaining = mmap.len().saturating_sub(*pos);
                let n = remaining.min(buf.len());
                buf[..n].copy_from_slice(&mmap[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
        }
    }
}

/// One consumer's cursor over a sealed bounded-blocking subpartition.
pub struct BoundedBlockingSubpartitionView {
    reader: Mutex<SpillReader>,
    data_remaining: AtomicI64,
    subpartition_released: Arc<AtomicBool>,
    own_released: AtomicBool,
}

impl BoundedBlockingSubpartitionView {
    pub(crate) fn new(file: Arc<SpillFile>, released: Arc<AtomicBool>) -> Result<Self> {
        let reader = file.create_reader()?;
        Ok(Self {
            reader: Mutex::new(reader),
            data_remaining: AtomicI64::new(file.data_buffers() as i64),
            subpartition_released: released,
            own_released: AtomicBool::new(false),
        })
    }

    fn check_released(&self) -> Result<()> {
        if self.subpartition_released.load(Ordering::Acquire)
            || self.own_released.load(Ordering::Acquire)
        {
            return Err(Error::PartitionReleased);
        }
        Ok(())
    }
}

impl SubpartitionView for BoundedBlockingSubpartitionView {
    fn poll_buffer(&self) -> Result<Option<BufferAndBacklog>> {
        self.check_released()?;
        let mut reader = self.reader.lock().unwrap();
        let Some(buffer) = reader.next_buffer()? else {
            return Ok(None);
        };
        let mut backlog = if buffer.is_data() {
            self.data_remaining.fetch_sub(1, Ordering::AcqRel) - 1
        } else {
            self.data_remaining.load(Ordering::Acquire)
        };
        if reader.is_exhausted() {
            // `-1` on the final buffer tells the consumer the stream ended.
            backlog = -1;
        }
        let next_data_type = reader.peek_meta()?.map(|m| m.data_type);
        Ok(Some(BufferAndBacklog {
            buffer,
            backlog,
            next_data_type,
        }))
    }

    fn backlog(&self) -> i64 {
        if self.check_released().is_err() {
            return -1;
        }
        let reader = self.reader.lock().unwrap();
        if reader.is_exhausted() {
            -1
        } else {
            self.data_remaining.load(Ordering::Acquire)
        }
    }

    fn peek_next_data_type(&self) -> Option<DataType> {
        if self.check_released().is_err() {
            return None;
        }
        let mut reader = self.reader.lock().unwrap();
        reader.peek_meta().ok().flatten().map(|m| m.data_type)
    }

    fn release(&self) {
        self.own_released.store(true, Ordering::Release);
    }

    fn is_released(&self) -> bool {
        self.own_released.load(Ordering::Acquire)
            || self.subpartition_released.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded::SpillWriter;
    use gridflow_core::Buffer;

    fn write_spill(path: &Path, values: u64, region_size: usize) {
        let mut writer = SpillWriter::create(path, region_size).unwrap();
        for i in 0..values {
            let buffer = Buffer::from_bytes(
                Bytes::copy_from_slice(&i.to_be_bytes()),
                DataType::Data,
                false,
            );
            writer.write_buffer(&buffer).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_open_validates_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill");
        write_spill(&path, 100, 256);

        for kind in [BoundedStorageKind::FileChannel, BoundedStorageKind::MemoryMapped] {
            let file = SpillFile::open(&path, kind).unwrap();
            assert_eq!(file.total_buffers(), 100);
            assert_eq!(file.data_buffers(), 100);
            assert!(file.num_regions() > 1);

            let mut reader = file.create_reader().unwrap();
            for i in 0..100u64 {
                let buffer = reader.next_buffer().unwrap().unwrap();
                assert_eq!(buffer.bytes().as_ref(), &i.to_be_bytes());
            }
            assert!(reader.next_buffer().unwrap().is_none());
            assert!(reader.is_exhausted());
        }
    }

    #[test]
    fn test_seek_to_buffer_via_region_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill");
        write_spill(&path, 1000, 128);

        for kind in [BoundedStorageKind::FileChannel, BoundedStorageKind::MemoryMapped] {
            let file = SpillFile::open(&path, kind).unwrap();
            let mut reader = file.create_reader().unwrap();
            for target in [0u32, 1, 499, 500, 999] {
                reader.seek_to_buffer(target).unwrap();
                let buffer = reader.next_buffer().unwrap().unwrap();
                assert_eq!(buffer.bytes().as_ref(), &(target as u64).to_be_bytes());
            }
            // Seeking to the end leaves an exhausted reader.
            reader.seek_to_buffer(1000).unwrap();
            assert!(reader.next_buffer().unwrap().is_none());
        }
    }

    #[test]
    fn test_corrupted_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill");
        write_spill(&path, 10, 256);

        // Flip one data byte; the CRC check must catch it.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SpillFile::open(&path, BoundedStorageKind::FileChannel),
            Err(Error::CrcMismatch)
        ));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill");
        write_spill(&path, 2, 256);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            SpillFile::open(&path, BoundedStorageKind::FileChannel),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spill");
        std::fs::write(&path, b"GFSP").unwrap();
        assert!(SpillFile::open(&path, BoundedStorageKind::FileChannel).is_err());
    }
}
