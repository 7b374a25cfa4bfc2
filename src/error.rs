//! Error types for the chunkfs library.
//!
//! One variant per failure class a public operation can surface. Recoverable
//! conditions carry the offending path or the relevant sizes; see
//! [`FsError::InvariantViolation`] for the one class that is not recoverable.

use thiserror::Error;

use crate::bitstream::CodecError;

/// Main error type for all filesystem operations.
#[derive(Error, Debug)]
pub enum FsError {
    /// Path or an intermediate directory does not exist.
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// Attempted create or move collides with an existing entry.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A file was found where a directory was expected.
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// A directory was found where a file was expected.
    #[error("Is a directory: {0}")]
    IsADirectory(String),

    /// `delete_directory` on a directory that still has entries.
    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Not enough free blocks to satisfy a growth request.
    #[error("Out of space: requested {requested} blocks, {available} free")]
    OutOfSpace { requested: u64, available: u64 },

    /// Read range starts past the end of the file.
    #[error("Read out of bounds: offset {offset} past end of file ({size} bytes)")]
    OutOfBounds { offset: u64, size: u64 },

    /// Encoded directory body does not fit in a single block.
    #[error("Directory body of {size} bytes exceeds the {max} byte block limit")]
    OversizedDirectory { size: u64, max: u64 },

    /// Partition size / block size combination the layout cannot support.
    #[error("Unsupported partition geometry: {0}")]
    InvalidGeometry(String),

    /// Bit stream decode failure.
    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),

    /// The backing store failed a read or write.
    #[error("Backing store failure: {0}")]
    Store(#[from] std::io::Error),

    /// An internal consistency check failed.
    ///
    /// This indicates a bug in the filesystem itself rather than a caller
    /// error. No recovery is attempted; embedders should treat the
    /// partition as suspect and stop issuing mutations.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Type alias for Results using FsError.
pub type Result<T> = std::result::Result<T, FsError>;
