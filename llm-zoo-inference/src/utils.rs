use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use std::fs::File;

/// Read-only view over a memory mapped file with a cursor for sequential header reads.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file).context("Failed to create memory mapping")? };
        Ok(Self { mmap, offset: 0 })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.get_bytes(std::mem::size_of::<u64>())?;
        Ok(LittleEndian::read_u64(bytes))
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        let remaining = self.mmap.len() - self.offset;
        if count > remaining {
            anyhow::bail!("Insufficient data: need {} bytes, have {} remaining", count, remaining);
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    /// Returns `count` bytes starting at an absolute `offset` without moving the cursor.
    pub fn get_bytes_at(&self, offset: usize, count: usize) -> Result<&[u8]> {
        match offset.checked_add(count) {
            Some(end) if end <= self.mmap.len() => Ok(&self.mmap[offset..end]),
            _ => anyhow::bail!(
                "Insufficient data: need {} bytes at offset {}, file has {} bytes",
                count,
                offset,
                self.mmap.len()
            ),
        }
    }
}
