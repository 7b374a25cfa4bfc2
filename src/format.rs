//! On-disk format for the partition filesystem.
//!
//! This module defines the binary layout of every persisted record and the
//! geometry math that places them inside the partition.
//!
//! ## Partition Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ Header region [0 .. HEADER_MAX_SIZE)                                │
//! │ - Magic number, version string                                      │
//! │ - Root directory descriptor (serialized inline)                     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ Allocation bitmap [max(HEADER_MAX_SIZE, BLOCK_SIZE) .. C)           │
//! │ - 1 bit per block (0=free, 1=used)                                  │
//! │ - Sized for every block between its own start and partition end     │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │ Content region [C .. END), C rounded up to a block boundary         │
//! │ - File and directory bodies as chains of single-block chunks        │
//! │ - Every chunk starts with a ChunkHeader                             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Block index `i` maps to absolute offset `bitmap_offset + i * BLOCK_SIZE`,
//! so the first indices overlap the bitmap itself; the allocator never
//! hands out an index below [`Layout::first_content_block`].
//!
//! ## Records
//!
//! All records serialize through the bit stream codec
//! ([`crate::bitstream`]); integers are 64-bit LSB-first, strings are
//! length-prefixed, and a [`FileDescriptor`] ends on a single `bool` bit,
//! so consecutive descriptors inside a directory body are generally not
//! byte-aligned. Directory bodies round up to whole bytes only at the end
//! of the buffer.

use log::{debug, warn};

use crate::bitstream::{BitReader, BitWriter, Result as CodecResult};
use crate::error::{FsError, Result};

/// Magic number identifying a formatted partition.
pub const FS_MAGIC: u64 = 0x1234_5678_90AB_CDEF;

/// Current format version string.
pub const FS_VERSION: &str = "Version 1";

/// Fixed capacity of the version field in the header, NUL padded.
pub const VERSION_FIELD_SIZE: usize = 32;

/// Maximum serialized size of the filesystem header, in bytes. The header
/// region is padded out to this size regardless of content.
pub const HEADER_MAX_SIZE: u64 = 4096;

/// Serialized size of a [`ChunkHeader`] in bytes (two `u64`s).
pub const CHUNK_HEADER_SIZE: u64 = 16;

/// Serialized size of a directory body prologue: the chunk header plus the
/// `u64` content length that enables a single-read decode.
pub const DIR_PROLOGUE_SIZE: u64 = CHUNK_HEADER_SIZE + 8;

// ============================================================================
// Chunk header
// ============================================================================

/// Header at the start of the first block of every chunk.
///
/// Chunks of one file form a singly linked list; `next_block_index == 0`
/// terminates the chain (block 0 always lies inside the header region, so
/// the sentinel is unambiguous). Every chunk currently covers exactly one
/// block; `block_count` is persisted to leave room for multi-block chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Block index of the next chunk in the chain, 0 for the last.
    pub next_block_index: u64,

    /// Number of blocks covered by this chunk.
    pub block_count: u64,
}

impl ChunkHeader {
    pub fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_u64(self.next_block_index);
        writer.write_u64(self.block_count);
    }

    pub fn decode(reader: &mut BitReader<'_>) -> CodecResult<Self> {
        Ok(Self {
            next_block_index: reader.read_u64()?,
            block_count: reader.read_u64()?,
        })
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Metadata record for a file or directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Entry name, unique within its directory.
    pub name: String,

    /// Total size of the file in bytes. Always 0 for directories.
    pub size: u64,

    /// Absolute offset of the first chunk. 0 means the file owns no
    /// blocks yet; directories always own their body block.
    pub first_chunk_offset: u64,

    /// Whether this entry is a directory.
    pub is_directory: bool,
}

impl FileDescriptor {
    pub fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_str(&self.name);
        writer.write_u64(self.size);
        writer.write_u64(self.first_chunk_offset);
        writer.write_bool(self.is_directory);
    }

    pub fn decode(reader: &mut BitReader<'_>) -> CodecResult<Self> {
        Ok(Self {
            name: reader.read_str()?,
            size: reader.read_u64()?,
            first_chunk_offset: reader.read_u64()?,
            is_directory: reader.read_bool()?,
        })
    }
}

/// Ordered list of entries making up one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryDescriptor {
    pub entries: Vec<FileDescriptor>,

    /// Runtime-only marker for the root directory, which lives inside the
    /// partition header instead of a content block. Never serialized;
    /// re-applied when the header is loaded.
    pub is_root: bool,
}

impl DirectoryDescriptor {
    /// An empty directory carrying the root marker.
    pub fn root() -> Self {
        Self {
            entries: Vec::new(),
            is_root: true,
        }
    }

    pub fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_u64(self.entries.len() as u64);
        for entry in &self.entries {
            entry.encode(writer);
        }
    }

    pub fn decode(reader: &mut BitReader<'_>) -> CodecResult<Self> {
        let count = reader.read_u64()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            entries.push(FileDescriptor::decode(reader)?);
        }
        Ok(Self {
            entries,
            is_root: false,
        })
    }
}

// ============================================================================
// Partition header
// ============================================================================

/// Filesystem header, persisted at offset 0.
///
/// The root directory is serialized inline: saving the root means
/// rewriting this header, and no content block is ever allocated for it.
#[derive(Debug, Clone)]
pub struct PartitionHeader {
    pub magic: u64,
    pub version: String,
    pub root: DirectoryDescriptor,
}

impl PartitionHeader {
    pub fn new(root: DirectoryDescriptor) -> Self {
        Self {
            magic: FS_MAGIC,
            version: FS_VERSION.to_string(),
            root,
        }
    }

    pub fn encode(&self, writer: &mut BitWriter<'_>) {
        writer.write_u64(self.magic);
        writer.write_fixed_str(&self.version, VERSION_FIELD_SIZE);
        self.root.encode(writer);
    }

    /// Decodes a header from the start of the partition.
    ///
    /// Returns `Ok(None)` when the magic number does not match — an
    /// unformatted partition, not an error.
    pub fn decode(reader: &mut BitReader<'_>) -> CodecResult<Option<Self>> {
        let magic = reader.read_u64()?;
        if magic != FS_MAGIC {
            warn!("no filesystem magic at partition start (found {magic:#018x}), treating as unformatted");
            return Ok(None);
        }

        let version = reader.read_fixed_str(VERSION_FIELD_SIZE)?;
        debug!("partition header version: {version}");

        let mut root = DirectoryDescriptor::decode(reader)?;
        root.is_root = true;

        Ok(Some(Self {
            magic,
            version,
            root,
        }))
    }
}

// ============================================================================
// Layout geometry
// ============================================================================

/// Partition geometry: where the bitmap and the content region live for a
/// given partition size and block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    partition_size: u64,
    block_size: u64,
}

impl Layout {
    /// Validates and builds the geometry.
    ///
    /// The block size must be a power of two of at least 64 bytes (so the
    /// chunk header and directory prologue always fit, and the bitmap
    /// offset stays block-aligned), and the partition must leave room for
    /// at least one allocatable content block.
    pub fn new(partition_size: u64, block_size: u64) -> Result<Self> {
        if block_size < 64 || !block_size.is_power_of_two() {
            return Err(FsError::InvalidGeometry(format!(
                "block size {block_size} must be a power of two of at least 64 bytes"
            )));
        }

        let layout = Self {
            partition_size,
            block_size,
        };
        if partition_size <= layout.bitmap_offset()
            || layout.first_content_block() >= layout.bitmap_bits()
        {
            return Err(FsError::InvalidGeometry(format!(
                "partition of {partition_size} bytes leaves no content blocks at block size {block_size}"
            )));
        }
        Ok(layout)
    }

    pub fn partition_size(&self) -> u64 {
        self.partition_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Content bytes carried by a single-block chunk.
    pub fn content_per_block(&self) -> u64 {
        self.block_size - CHUNK_HEADER_SIZE
    }

    /// Absolute offset of the allocation bitmap: directly after the header
    /// region, or after the first block when blocks are larger than it.
    pub fn bitmap_offset(&self) -> u64 {
        HEADER_MAX_SIZE.max(self.block_size)
    }

    /// One bit per block between the bitmap start and the partition end.
    pub fn bitmap_bits(&self) -> u64 {
        (self.partition_size - self.bitmap_offset()) / self.block_size
    }

    /// Bitmap size rounded up to whole bytes.
    pub fn bitmap_bytes(&self) -> u64 {
        self.bitmap_bits().div_ceil(8)
    }

    /// First block-aligned offset past the bitmap.
    pub fn content_start(&self) -> u64 {
        let bitmap_end = self.bitmap_offset() + self.bitmap_bytes();
        bitmap_end.next_multiple_of(self.block_size)
    }

    /// Partition size aligned down to a block boundary.
    pub fn content_end(&self) -> u64 {
        self.partition_size - self.partition_size % self.block_size
    }

    /// Lowest block index the allocator may hand out. Indices below this
    /// map into the header or bitmap regions and are permanently reserved.
    pub fn first_content_block(&self) -> u64 {
        self.content_start() / self.block_size
    }

    /// Maps a block index to its absolute partition offset.
    pub fn block_offset(&self, index: u64) -> u64 {
        let offset = self.bitmap_offset() + index * self.block_size;
        debug_assert_eq!(offset % self.block_size, 0);
        offset
    }

    /// Maps a block-aligned absolute offset back to its block index.
    pub fn block_index(&self, offset: u64) -> u64 {
        debug_assert!(offset >= self.bitmap_offset());
        debug_assert_eq!(offset % self.block_size, 0);
        (offset - self.bitmap_offset()) / self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::BitBuffer;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_chunk_header_pinned_bytes() {
        let header = ChunkHeader {
            next_block_index: 2,
            block_count: 1,
        };
        let mut buffer = BitBuffer::new();
        header.encode(&mut BitWriter::new(&mut buffer));

        assert_eq!(buffer.byte_len() as u64, CHUNK_HEADER_SIZE);
        assert_eq!(
            buffer.as_bytes(),
            &[2, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_file_descriptor_roundtrip() {
        let descriptor = FileDescriptor {
            name: "Test.txt".to_string(),
            size: 14,
            first_chunk_offset: 139_264,
            is_directory: false,
        };

        let mut buffer = BitBuffer::new();
        descriptor.encode(&mut BitWriter::new(&mut buffer));

        let decoded = FileDescriptor::decode(&mut BitReader::new(&buffer)).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_directory_roundtrip_with_unaligned_entries() {
        // The trailing bool of each descriptor shifts every following
        // entry off byte alignment; the codec must not care.
        let directory = DirectoryDescriptor {
            entries: vec![
                FileDescriptor {
                    name: "alpha".to_string(),
                    size: 0,
                    first_chunk_offset: 0,
                    is_directory: false,
                },
                FileDescriptor {
                    name: "beta".to_string(),
                    size: 512,
                    first_chunk_offset: 139_264,
                    is_directory: true,
                },
                FileDescriptor {
                    name: "gamma".to_string(),
                    size: u64::MAX,
                    first_chunk_offset: 140_288,
                    is_directory: false,
                },
            ],
            is_root: false,
        };

        let mut buffer = BitBuffer::new();
        directory.encode(&mut BitWriter::new(&mut buffer));

        let decoded = DirectoryDescriptor::decode(&mut BitReader::new(&buffer)).unwrap();
        assert_eq!(decoded, directory);
    }

    #[test]
    fn test_header_roundtrip_keeps_root_marker() {
        let mut root = DirectoryDescriptor::root();
        root.entries.push(FileDescriptor {
            name: "Foo".to_string(),
            size: 0,
            first_chunk_offset: 139_264,
            is_directory: true,
        });

        let header = PartitionHeader::new(root.clone());
        let mut buffer = BitBuffer::new();
        header.encode(&mut BitWriter::new(&mut buffer));

        let decoded = PartitionHeader::decode(&mut BitReader::new(&buffer))
            .unwrap()
            .expect("magic must match");
        assert_eq!(decoded.magic, FS_MAGIC);
        assert_eq!(decoded.version, FS_VERSION);
        assert_eq!(decoded.root.entries, root.entries);
        assert!(decoded.root.is_root);
    }

    #[test]
    fn test_header_decode_rejects_bad_magic() {
        let buffer = BitBuffer::from_bytes(vec![0u8; HEADER_MAX_SIZE as usize]);
        let decoded = PartitionHeader::decode(&mut BitReader::new(&buffer)).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn test_layout_one_gib_partition() {
        let layout = Layout::new(GIB, 1024).unwrap();
        assert_eq!(layout.bitmap_offset(), 4096);
        assert_eq!(layout.bitmap_bits(), 1_048_572);
        assert_eq!(layout.bitmap_bytes(), 131_072);
        assert_eq!(layout.content_start(), 135_168);
        assert_eq!(layout.content_end(), GIB);
        assert_eq!(layout.first_content_block(), 132);
        assert_eq!(layout.block_offset(132), 4096 + 132 * 1024);
        assert_eq!(layout.block_index(layout.block_offset(132)), 132);
    }

    #[test]
    fn test_layout_block_larger_than_header() {
        let layout = Layout::new(1024 * 1024, 8192).unwrap();
        assert_eq!(layout.bitmap_offset(), 8192);
        assert_eq!(layout.bitmap_bits(), 127);
        assert_eq!(layout.bitmap_bytes(), 16);
        assert_eq!(layout.content_start(), 16_384);
        assert_eq!(layout.first_content_block(), 2);
    }

    #[test]
    fn test_layout_rejects_bad_geometry() {
        assert!(Layout::new(GIB, 1000).is_err());
        assert!(Layout::new(GIB, 32).is_err());
        assert!(Layout::new(4096, 1024).is_err());
    }
}
