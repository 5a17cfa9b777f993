//! Spill file writer: sequential append, region sealing, index + footer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use crc32fast::Hasher;
use gridflow_core::Buffer;

use super::{Region, ENTRY_HEADER_SIZE, SPILL_MAGIC, SPILL_VERSION};
use crate::error::Result;

/// Builds one subpartition's spill file. Not thread-safe; owned by the
/// producing task's write path.
pub(crate) struct SpillWriter {
    file: BufWriter<File>,
    hasher: Hasher,
    position: u64,
    region_size: usize,
    regions: Vec<Region>,
    region_start: u64,
    region_first_buffer: u32,
    buffers_in_region: u32,
    total_buffers: u32,
    data_buffers: u32,
}

impl SpillWriter {
    pub(crate) fn create(path: &Path, region_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            hasher: Hasher::new(),
            position: 0,
            region_size: region_size.max(1),
            regions: Vec::new(),
            region_start: 0,
            region_first_buffer: 0,
            buffers_in_region: 0,
            total_buffers: 0,
            data_buffers: 0,
        };

        let mut header = BytesMut::with_capacity(super::HEADER_SIZE);
        header.put_slice(&SPILL_MAGIC);
        header.put_u16(SPILL_VERSION);
        header.put_u16(0); // reserved
        writer.write_hashed(&header)?;
        writer.region_start = writer.position;
        Ok(writer)
    }

    /// Append one length-prefixed buffer entry; seal the region when it
    /// reaches the size threshold. Entries never straddle regions.
    pub(crate) fn write_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        let mut header = BytesMut::with_capacity(ENTRY_HEADER_SIZE);
        header.put_u32(buffer.len() as u32);
        header.put_u8(buffer.data_type().as_u8());
        header.put_u8(buffer.is_compressed() as u8);
        self.write_hashed(&header)?;
        self.write_hashed(buffer.bytes())?;

        self.total_buffers += 1;
        self.buffers_in_region += 1;
        if buffer.is_data() {
            self.data_buffers += 1;
        }

        if self.position - self.region_start >= self.region_size as u64 {
            self.seal_region();
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn data_buffers(&self) -> u32 {
        self.data_buffers
    }

    /// Seal the final region, append index and footer, and sync to disk.
    pub(crate) fn finish(mut self) -> Result<()> {
        self.seal_region();

        let index_position = self.position;
        let mut index = BytesMut::with_capacity(self.regions.len() * super::INDEX_ENTRY_SIZE);
        for region in &self.regions {
            index.put_u64(region.file_offset);
            index.put_u32(region.first_buffer);
            index.put_u32(region.num_buffers);
        }
        self.write_hashed(&index)?;

        let crc = self.hasher.clone().finalize();
        let mut footer = BytesMut::with_capacity(super::FOOTER_SIZE);
        footer.put_u64(index_position);
        footer.put_u32(self.regions.len() as u32);
        footer.put_u32(self.total_buffers);
        footer.put_u32(self.data_buffers);
        footer.put_u32(crc);
        footer.put_slice(&SPILL_MAGIC);
        self.file.write_all(&footer)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    fn seal_region(&mut self) {
        if self.buffers_in_region == 0 {
            return;
        }
        self.regions.push(Region {
            file_offset: self.region_start,
            first_buffer: self.region_first_buffer,
            num_buffers: self.buffers_in_region,
        });
        self.region_start = self.position;
        self.region_first_buffer = self.total_buffers;
        self.buffers_in_region = 0;
    }

    fn write_hashed(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }
}
