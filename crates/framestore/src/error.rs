//! Error and Result types for framestore operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for framestore operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Stable numeric error taxonomy.
///
/// These values are part of the on-the-wire contract with embedders and
/// never change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// File or catalog open failed.
    CantOpen = 1,
    /// Catalog missing or unreadable.
    Schema = 2,
    /// No block available and auto-reclaim disabled.
    NoFreeBlocks = 3,
    /// Header's block size outside the allowed range.
    InvalidBlockSize = 4,
    /// A live writer already holds this stream tag.
    DuplicateStreamTag = 5,
    /// Segment insert failed.
    UnableToCreateSegment = 6,
    /// Segment-block insert failed.
    UnableToCreateSegmentBlock = 7,
    /// Timestamp not greater than the last written.
    NonMonotonicTimestamp = 8,
    /// Payload exceeds per-block capacity.
    RowSizeTooBig = 9,
    /// File preallocation failed.
    UnableToAllocateFile = 10,
    /// Null or invalid input.
    InvalidArgument = 11,
    /// Internal invariant violation.
    Unknown = 12,
}

/// The error type for framestore operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Container file or catalog sidecar could not be opened.
    #[error("Unable to open {path}: {reason}")]
    CantOpen {
        /// Path that failed to open.
        path: String,
        /// Underlying failure description.
        reason: String,
    },

    /// Catalog schema is missing, unreadable, or a statement failed.
    #[error("Catalog error: {0}")]
    Schema(String),

    /// No free block exists and auto-reclaim is disabled.
    #[error("No free blocks available")]
    NoFreeBlocks,

    /// The header's block size is outside `[4096, 1 GiB]`.
    #[error("Invalid block size in file header: {0}")]
    InvalidBlockSize(u32),

    /// Another live write context already owns this stream tag.
    #[error("A live writer already holds stream tag {0:?}")]
    DuplicateStreamTag(String),

    /// Inserting the segment row failed.
    #[error("Unable to create segment: {0}")]
    UnableToCreateSegment(String),

    /// Inserting the segment-block row failed.
    #[error("Unable to create segment block: {0}")]
    UnableToCreateSegmentBlock(String),

    /// Timestamp is not strictly greater than the last written timestamp.
    #[error("Non-monotonic timestamp {timestamp} (last written {last})")]
    NonMonotonicTimestamp {
        /// Rejected timestamp.
        timestamp: i64,
        /// Last timestamp accepted by the context.
        last: i64,
    },

    /// Payload cannot fit in a block even when the block is empty.
    #[error("Frame of {size} bytes exceeds per-block capacity of {max} bytes")]
    RowSizeTooBig {
        /// Rejected payload size.
        size: usize,
        /// Largest payload the block size admits.
        max: usize,
    },

    /// Contiguous preallocation of the container file failed.
    #[error("Unable to allocate container file: {0}")]
    UnableToAllocateFile(io::Error),

    /// Null or otherwise invalid caller input.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Unknown(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Underlying catalog engine error.
    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
}

impl StoreError {
    /// Returns the stable numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::CantOpen { .. } => ErrorCode::CantOpen,
            StoreError::Schema(_) => ErrorCode::Schema,
            StoreError::NoFreeBlocks => ErrorCode::NoFreeBlocks,
            StoreError::InvalidBlockSize(_) => ErrorCode::InvalidBlockSize,
            StoreError::DuplicateStreamTag(_) => ErrorCode::DuplicateStreamTag,
            StoreError::UnableToCreateSegment(_) => ErrorCode::UnableToCreateSegment,
            StoreError::UnableToCreateSegmentBlock(_) => ErrorCode::UnableToCreateSegmentBlock,
            StoreError::NonMonotonicTimestamp { .. } => ErrorCode::NonMonotonicTimestamp,
            StoreError::RowSizeTooBig { .. } => ErrorCode::RowSizeTooBig,
            StoreError::UnableToAllocateFile(_) => ErrorCode::UnableToAllocateFile,
            StoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            StoreError::Unknown(_) => ErrorCode::Unknown,
            StoreError::Io(_) => ErrorCode::Unknown,
            StoreError::Catalog(_) => ErrorCode::Schema,
        }
    }
}
