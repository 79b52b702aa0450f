use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::sync::Arc;

/// Sequential cursor over a read-only memory-mapped file.
///
/// The mapping is reference counted so that weights can keep aliasing its pages
/// after the loader is gone.
#[derive(Debug, Clone)]
pub(crate) struct MemoryMapper {
    mmap: Arc<Mmap>,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: &File) -> Result<Self> {
        // SAFETY: the mapping is read-only; the file must not be truncated while mapped.
        let mmap = unsafe { memmap2::MmapOptions::new().map(file).context("Failed to create memory mapping")? };
        Ok(Self { mmap: Arc::new(mmap), offset: 0 })
    }

    pub fn mmap(&self) -> &Arc<Mmap> {
        &self.mmap
    }

    pub fn remaining(&self) -> &[u8] {
        &self.mmap[self.offset..]
    }

    /// Advances past `count` bytes and returns their range within the mapping.
    pub fn take(&mut self, count: usize) -> Result<Range<usize>> {
        if self.offset + count > self.mmap.len() {
            anyhow::bail!("Insufficient data: need {} bytes, have {} remaining", count, self.mmap.len() - self.offset);
        }
        let range = self.offset..self.offset + count;
        self.offset += count;
        Ok(range)
    }
}

impl Read for MemoryMapper {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.mmap.len() - self.offset);
        buf[..n].copy_from_slice(&self.mmap[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// Payload bytes that either alias a mapped file or are owned.
#[derive(Debug, Clone)]
pub enum Bytes {
    Mapped { mmap: Arc<Mmap>, range: Range<usize> },
    Owned(Vec<u8>),
}

impl Bytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Bytes::Mapped { mmap, range } => &mmap[range.clone()],
            Bytes::Owned(data) => data,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Bytes::Mapped { .. })
    }
}
