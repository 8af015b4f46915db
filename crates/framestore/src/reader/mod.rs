//! Reader: time-range reads and stream introspection over a container.
//!
//! A [`Reader`] opens the container and its catalog strictly read-only.
//! It never mutates either; recovery and maintenance belong to the
//! writer. Readers may run concurrently with a live writer: the
//! committed-count protocol bounds what they observe, and frames that
//! fail tag validation (torn appends, stale tenants) are skipped
//! silently.

pub mod iter;

use crate::block::BlockView;
use crate::catalog::Catalog;
pub use crate::catalog::ContiguousRegion;
use crate::error::Result;
use crate::layout::{catalog_path, Container, Timestamp};
use std::path::{Path, PathBuf};

/// One frame handed to a range-read callback.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Payload bytes, borrowed from the block mapping.
    pub payload: &'a [u8],
    /// Caller-defined flags byte.
    pub flags: u8,
    /// Frame timestamp.
    pub timestamp: Timestamp,
    /// Per-segment sequence number of the containing block.
    pub block_sequence: i64,
    /// Metadata of the segment the frame belongs to.
    pub metadata: &'a str,
}

/// Read handle over one container file.
pub struct Reader {
    container: Container,
    db_path: PathBuf,
}

impl Reader {
    /// Opens a container for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let container = Container::open(path, false)?;
        let db_path = catalog_path(container.path());
        Ok(Self { container, db_path })
    }

    /// Streams every frame of `stream_tag` with timestamp in `[lo, hi]`
    /// to `callback`, in stream order.
    ///
    /// The first matching block is entered through a lower-bound binary
    /// search on its index; subsequent blocks are consumed from slot
    /// zero. Iteration stops at the first timestamp past `hi`. Frames
    /// failing validation are skipped.
    pub fn read<F>(
        &self,
        stream_tag: &str,
        lo: Timestamp,
        hi: Timestamp,
        mut callback: F,
    ) -> Result<()>
    where
        F: FnMut(Frame<'_>),
    {
        let catalog = Catalog::open(&self.db_path, false)?;
        let rows = catalog.blocks_in_range(stream_tag, lo, hi)?;

        let mut first_block = true;
        for row in rows {
            let view = BlockView::map(&self.container, row.block_idx)?;
            let n = view.n_valid();

            let mut slot = 0;
            if first_block {
                slot = view.lower_bound(n, lo);
                first_block = false;
            }

            for slot in slot..n {
                let (timestamp, offset) = view.index_entry(slot);
                if timestamp > hi {
                    return Ok(());
                }
                let Some(frame) = view.frame(offset, &row.uuid) else {
                    continue;
                };
                callback(Frame {
                    payload: frame.payload,
                    flags: frame.flags,
                    timestamp,
                    block_sequence: row.sequence,
                    metadata: &row.metadata,
                });
            }
        }
        Ok(())
    }

    /// Groups the stream's blocks intersecting `[lo, hi]` into contiguous
    /// regions of consecutive sequence numbers.
    ///
    /// Gaps appear where blocks were freed or reclaimed.
    pub fn query_contiguous_segments(
        &self,
        stream_tag: &str,
        lo: Timestamp,
        hi: Timestamp,
    ) -> Result<Vec<ContiguousRegion>> {
        let catalog = Catalog::open(&self.db_path, false)?;
        catalog.contiguous_regions(stream_tag, lo, hi)
    }

    /// Lists the distinct stream tags with data intersecting `[lo, hi]`.
    pub fn query_stream_tags(&self, lo: Timestamp, hi: Timestamp) -> Result<Vec<String>> {
        let catalog = Catalog::open(&self.db_path, false)?;
        catalog.stream_tags_in_range(lo, hi)
    }

    /// Size of every block in the underlying container.
    pub fn block_size(&self) -> u32 {
        self.container.block_size()
    }

    /// Number of blocks in the underlying container.
    pub fn n_blocks(&self) -> u32 {
        self.container.n_blocks()
    }
}
