//! Timestamp-indexed cursor over one stream's frames.
//!
//! The iterator walks a stream frame by frame across block and segment
//! boundaries, in both directions, with O(log n) seeks. Its position is
//! the triple `(segment_id, block sequence, frame index)`; block
//! mappings are created lazily on first visit and cached for the
//! iterator's lifetime.
//!
//! An iterator that runs off either end of the stream, or lands on a
//! frame that fails validation, becomes invalid. `next`/`prev` on an
//! invalid iterator stay invalid; only [`FrameIterator::reset`] or
//! [`FrameIterator::find`] can revive it.

use crate::block::BlockView;
use crate::catalog::{Catalog, SegmentBlockRow};
use crate::error::Result;
use crate::layout::{catalog_path, Container, Timestamp};
use crate::reader::Frame;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// A block visited by the iterator, mapped and pinned for its lifetime.
struct CachedBlock {
    view: BlockView,
    /// Committed count snapshotted when the block was first visited.
    n_valid: u32,
    uuid: Uuid,
    metadata: String,
}

/// The iterator's current frame, resolved and validated.
#[derive(Debug, Clone, Copy)]
struct Position {
    segment_id: i64,
    sequence: i64,
    frame_idx: u32,
    timestamp: Timestamp,
    offset: u64,
}

/// A bidirectional, seekable cursor over one stream.
pub struct FrameIterator {
    container: Container,
    catalog: Catalog,
    stream_tag: String,
    cache: HashMap<(i64, i64), CachedBlock>,
    position: Option<Position>,
}

impl FrameIterator {
    /// Opens an iterator over `stream_tag`, positioned at the stream's
    /// first frame (invalid when the stream has none).
    pub fn open(path: impl AsRef<Path>, stream_tag: &str) -> Result<Self> {
        let container = Container::open(path, false)?;
        let catalog = Catalog::open(&catalog_path(container.path()), false)?;

        let mut iterator = Self {
            container,
            catalog,
            stream_tag: stream_tag.to_string(),
            cache: HashMap::new(),
            position: None,
        };
        iterator.reset()?;
        Ok(iterator)
    }

    /// True while the iterator points at a committed, validated frame.
    pub fn valid(&self) -> bool {
        self.position.is_some()
    }

    /// The current frame, or `None` when the iterator is invalid.
    pub fn current(&self) -> Option<Frame<'_>> {
        let pos = self.position.as_ref()?;
        let block = self.cache.get(&(pos.segment_id, pos.sequence))?;
        let frame = block.view.frame(pos.offset, &block.uuid)?;
        Some(Frame {
            payload: frame.payload,
            flags: frame.flags,
            timestamp: pos.timestamp,
            block_sequence: pos.sequence,
            metadata: &block.metadata,
        })
    }

    /// Metadata of the segment owning the current frame.
    pub fn current_metadata(&self) -> Option<&str> {
        let pos = self.position.as_ref()?;
        self.cache
            .get(&(pos.segment_id, pos.sequence))
            .map(|block| block.metadata.as_str())
    }

    /// Sequence number of the block the iterator stands in.
    pub fn block_sequence(&self) -> Option<i64> {
        self.position.as_ref().map(|pos| pos.sequence)
    }

    /// Moves to the next frame, crossing into the next block and then
    /// the next segment as needed. A no-op when invalid.
    pub fn next(&mut self) -> Result<()> {
        let Some(pos) = self.position else {
            return Ok(());
        };

        let n_valid = self
            .cache
            .get(&(pos.segment_id, pos.sequence))
            .map(|block| block.n_valid)
            .unwrap_or(0);

        if pos.frame_idx + 1 < n_valid {
            self.position_at(pos.segment_id, pos.sequence, pos.frame_idx + 1);
            return Ok(());
        }

        match self
            .catalog
            .next_block(&self.stream_tag, pos.segment_id, pos.sequence)?
        {
            Some(row) => {
                self.cache_block(&row)?;
                self.position_at(row.segment_id, row.sequence, 0);
            }
            None => self.position = None,
        }
        Ok(())
    }

    /// Moves to the previous frame, crossing block and segment
    /// boundaries backwards. A no-op when invalid.
    pub fn prev(&mut self) -> Result<()> {
        let Some(pos) = self.position else {
            return Ok(());
        };

        if pos.frame_idx > 0 {
            self.position_at(pos.segment_id, pos.sequence, pos.frame_idx - 1);
            return Ok(());
        }

        match self
            .catalog
            .prev_block(&self.stream_tag, pos.segment_id, pos.sequence)?
        {
            Some(row) => {
                self.cache_block(&row)?;
                let last = self
                    .cache
                    .get(&(row.segment_id, row.sequence))
                    .map(|block| block.n_valid.saturating_sub(1))
                    .unwrap_or(0);
                self.position_at(row.segment_id, row.sequence, last);
            }
            None => self.position = None,
        }
        Ok(())
    }

    /// Seeks to the first frame with timestamp `>= timestamp`.
    ///
    /// Prefers the block containing the timestamp, falling back to the
    /// first block starting after it (so a seek before the stream's
    /// beginning lands on the first frame). When the lower bound falls
    /// past the block's last slot, the cursor advances one block.
    /// Returns whether the iterator is valid afterwards.
    pub fn find(&mut self, timestamp: Timestamp) -> Result<bool> {
        let Some(row) = self
            .catalog
            .block_for_timestamp(&self.stream_tag, timestamp)?
        else {
            self.position = None;
            return Ok(false);
        };

        self.cache_block(&row)?;
        let (n_valid, slot) = match self.cache.get(&(row.segment_id, row.sequence)) {
            Some(block) => (
                block.n_valid,
                block.view.lower_bound(block.n_valid, timestamp),
            ),
            None => (0, 0),
        };

        if slot < n_valid {
            self.position_at(row.segment_id, row.sequence, slot);
        } else {
            // Everything in this block is older; the answer starts at the
            // next block's first frame.
            match self
                .catalog
                .next_block(&self.stream_tag, row.segment_id, row.sequence)?
            {
                Some(next) => {
                    self.cache_block(&next)?;
                    self.position_at(next.segment_id, next.sequence, 0);
                }
                None => self.position = None,
            }
        }
        Ok(self.valid())
    }

    /// Repositions at the first frame of the stream's first segment.
    pub fn reset(&mut self) -> Result<()> {
        match self.catalog.first_block(&self.stream_tag)? {
            Some(row) => {
                self.cache_block(&row)?;
                self.position_at(row.segment_id, row.sequence, 0);
            }
            None => self.position = None,
        }
        Ok(())
    }

    /// Maps and caches a block on first visit.
    fn cache_block(&mut self, row: &SegmentBlockRow) -> Result<()> {
        let key = (row.segment_id, row.sequence);
        if self.cache.contains_key(&key) {
            return Ok(());
        }
        let view = BlockView::map(&self.container, row.block_idx)?;
        let n_valid = view.n_valid();
        self.cache.insert(
            key,
            CachedBlock {
                view,
                n_valid,
                uuid: row.uuid,
                metadata: row.metadata.clone(),
            },
        );
        Ok(())
    }

    /// Points the cursor at `(segment_id, sequence, frame_idx)`,
    /// invalidating it when the slot is out of range or its frame fails
    /// validation. The block must already be cached.
    fn position_at(&mut self, segment_id: i64, sequence: i64, frame_idx: u32) {
        let Some(block) = self.cache.get(&(segment_id, sequence)) else {
            self.position = None;
            return;
        };
        if frame_idx >= block.n_valid {
            self.position = None;
            return;
        }
        let (timestamp, offset) = block.view.index_entry(frame_idx);
        if block.view.frame(offset, &block.uuid).is_none() {
            self.position = None;
            return;
        }
        self.position = Some(Position {
            segment_id,
            sequence,
            frame_idx,
            timestamp,
            offset,
        });
    }
}
