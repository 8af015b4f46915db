//! Framestore - Embedded Append-Only Frame Storage Engine
//!
//! This crate persists variable-size timestamped frames across many
//! independent logical streams in a single pre-allocated container file,
//! with a relational catalog in a SQLite sidecar.
//!
//! # Components
//!
//! - [`allocate`]: create a container file and its catalog
//! - [`Writer`] / [`WriteContext`]: lock-free single-producer appends with
//!   automatic block rollover
//! - [`Reader`]: time-range reads and stream introspection
//! - [`FrameIterator`]: bidirectional, seekable per-stream cursor
//!
//! # Example
//!
//! ```rust,ignore
//! use framestore::{allocate, FrameIterator, Writer};
//!
//! // One-time: carve out 1024 blocks of 1 MiB.
//! allocate("video.nts", 1024 * 1024, 1024)?;
//!
//! let writer = Writer::open("video.nts", true)?;
//! let mut ctx = writer.create_write_context("cam-front", "h264")?;
//! writer.write(&mut ctx, &frame_bytes, timestamp_ns, keyframe_flag)?;
//! drop(ctx); // finalizes the open block
//!
//! let mut it = FrameIterator::open("video.nts", "cam-front")?;
//! it.find(timestamp_ns)?;
//! while it.valid() {
//!     let frame = it.current().unwrap();
//!     decode(frame.payload, frame.timestamp);
//!     it.next()?;
//! }
//! ```
//!
//! # Durability model
//!
//! Durability is per-block, not per-frame: a block is flushed when it is
//! recycled for a new life and when it rolls over full. Frames appended in
//! between reach disk through the page cache; after a crash, the next
//! writer open runs a recovery scan that truncates torn appends and
//! finalizes whatever the catalog still believes is open.

#![deny(missing_docs)]

pub mod block;
pub mod catalog;
pub mod error;
pub mod layout;
pub mod reader;
pub mod writer;

pub use error::{ErrorCode, Result, StoreError};
pub use layout::{allocate, Timestamp};
pub use reader::iter::FrameIterator;
pub use reader::{ContiguousRegion, Frame, Reader};
pub use writer::{WriteContext, Writer};
