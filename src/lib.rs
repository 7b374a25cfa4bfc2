//! chunkfs - a block-structured filesystem inside a single fixed-size
//! partition.
//!
//! The partition is an opaque byte array reached only through the two
//! [`BackingStore`] primitives; on top of them the crate provides a
//! hierarchical namespace of directories and files, variable-size file
//! contents through a chain-of-chunks layout, and free-space tracking
//! through an allocation bitmap.
//!
//! # Partition layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header [0 .. 4096): magic, version, root directory         │
//! ├────────────────────────────────────────────────────────────┤
//! │ Allocation bitmap: 1 bit per block                         │
//! ├────────────────────────────────────────────────────────────┤
//! │ Content blocks: file and directory bodies as chunk chains  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use chunkfs::{Filesystem, MemoryBackend};
//!
//! let size = 1024 * 1024;
//! let mut fs = Filesystem::mount(MemoryBackend::new(size), size as u64, 1024).unwrap();
//!
//! fs.create_directory("docs").unwrap();
//! fs.create_file("docs/hello.txt").unwrap();
//! fs.write("docs/hello.txt", b"Hello, World!", 0).unwrap();
//!
//! let mut buf = [0u8; 13];
//! fs.read("docs/hello.txt", 0, &mut buf).unwrap();
//! assert_eq!(&buf, b"Hello, World!");
//! ```
//!
//! The filesystem is single-writer and performs no internal locking; a
//! multi-threaded embedder must serialize all calls behind one lock. There
//! is no journal: a crash mid-operation can leak blocks (bitmap bits with
//! no reachable chunk), which is detectable but not repaired here.

pub mod bitmap;
pub mod bitstream;
pub mod error;
pub mod format;
pub mod fs;
pub mod path;
pub mod store;

// Re-export commonly used types
pub use bitstream::{BitBuffer, BitReader, BitWriter, CodecError};
pub use error::{FsError, Result};
pub use format::{
    ChunkHeader, DirectoryDescriptor, FileDescriptor, Layout, PartitionHeader,
    CHUNK_HEADER_SIZE, FS_MAGIC, FS_VERSION, HEADER_MAX_SIZE,
};
pub use fs::{format_bytes, Filesystem};
pub use path::FsPath;
pub use store::{BackingStore, FileBackend, MemoryBackend};
