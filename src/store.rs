//! Backing store abstraction for the partition byte array.
//!
//! The filesystem core never touches a real device; it sees the partition
//! only through [`BackingStore`]. Production embedders wrap a host file or
//! a raw block device, tests use [`MemoryBackend`].

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Trait for partition backing stores.
///
/// This abstraction allows the filesystem to work with different storage
/// types:
/// - Host files ([`FileBackend`])
/// - In-memory buffers ([`MemoryBackend`], for testing)
/// - Raw devices (embedder supplied)
///
/// Both operations transfer *exactly* the requested byte count or fail;
/// short transfers are reported as errors, never as partial success. The
/// core serializes all calls itself, so implementations do not need to be
/// thread-safe.
pub trait BackingStore {
    /// Fills `buf` from the partition starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes all of `data` to the partition starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Flushes any buffered writes to the underlying storage.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Total size of the partition in bytes.
    fn size(&self) -> io::Result<u64>;
}

/// File-based backing store for partitions kept in a host file.
///
/// `base_offset` allows the partition to live inside a larger container
/// file; all partition offsets are translated by it.
pub struct FileBackend<F> {
    file: F,
    base_offset: u64,
}

impl<F> FileBackend<F> {
    pub fn new(file: F, base_offset: u64) -> Self {
        Self { file, base_offset }
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl<F: Read + Write + Seek> BackingStore for FileBackend<F> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.base_offset + offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.base_offset + offset))?;
        self.file.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn size(&self) -> io::Result<u64> {
        // Stream length is not observable without seeking; the filesystem
        // takes the partition size as a mount parameter instead.
        Ok(u64::MAX)
    }
}

/// In-memory backing store for testing.
pub struct MemoryBackend {
    data: Vec<u8>,
}

impl MemoryBackend {
    /// Creates a zero-filled partition of the given size.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
        }
    }

    /// Wraps an existing partition image.
    pub fn from_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns the raw partition image.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "access of {len} bytes at offset {offset} exceeds partition size {}",
                        self.data.len()
                    ),
                )
            })?;
        Ok(start..end)
    }
}

impl BackingStore for MemoryBackend {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let range = self.range(offset, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }
}
