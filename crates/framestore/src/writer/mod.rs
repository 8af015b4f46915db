//! Writer: drives write contexts over a container.
//!
//! A [`Writer`] binds one container file. Callers obtain a
//! [`WriteContext`] per stream; each context owns one segment row in the
//! catalog and at most one mapped block at a time. Appends are lock-free:
//! the catalog is only touched when a context acquires its first block,
//! rolls over a full one, or shuts down.
//!
//! At most one live context may exist per stream tag in the process. The
//! constraint is tracked in a process-wide set behind a mutex that is
//! taken only at context creation and destruction, never on the append
//! path.
//!
//! Durability is per-block: a block is flushed synchronously when it is
//! recycled and again when it rolls over. Frames appended since the last
//! flush reach disk through the page cache; the recovery scan at the next
//! writer open repairs whatever a crash tore off.

use crate::block::{AppendOutcome, BlockMut};
use crate::catalog::Catalog;
use crate::error::{Result, StoreError};
use crate::layout::{catalog_path, max_payload, Container, Timestamp};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, error};
use uuid::Uuid;

/// Stream tags with a live write context anywhere in this process.
fn live_stream_tags() -> &'static Mutex<HashSet<String>> {
    static LIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock_live_tags() -> std::sync::MutexGuard<'static, HashSet<String>> {
    live_stream_tags()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The block a context is currently appending into.
#[derive(Debug)]
struct CurrentBlock {
    /// Catalog row id of the binding.
    segment_block_id: i64,
    /// Validation tag written into every frame.
    uuid: Uuid,
    block: BlockMut,
}

/// One writer session over one stream.
///
/// Created by [`Writer::create_write_context`]; holds the segment row,
/// the last accepted timestamp, and the currently bound block. Dropping
/// the context finalizes its open block and releases the stream tag.
/// Movable but not clonable; a context serves one caller at a time.
#[derive(Debug)]
pub struct WriteContext {
    stream_tag: String,
    metadata: String,
    segment_id: i64,
    next_sequence: i64,
    last_timestamp: Option<Timestamp>,
    current: Option<CurrentBlock>,
    db_path: PathBuf,
}

impl WriteContext {
    /// The stream tag this context writes.
    pub fn stream_tag(&self) -> &str {
        &self.stream_tag
    }

    /// The caller-supplied metadata recorded on this context's segment.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Timestamp of the last frame accepted by this context, if any.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }
}

impl Drop for WriteContext {
    fn drop(&mut self) {
        // Finalize is best effort: a failed catalog write here leaves an
        // open binding that the next writer open repairs via the
        // recovery scan.
        if let (Some(last), Some(current)) = (self.last_timestamp, self.current.take()) {
            match Catalog::open(&self.db_path, true) {
                Ok(mut catalog) => {
                    if let Err(e) = catalog.finalize_and_sweep(current.segment_block_id, last) {
                        error!(
                            stream_tag = %self.stream_tag,
                            error = %e,
                            "failed to finalize block on context close"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        stream_tag = %self.stream_tag,
                        error = %e,
                        "failed to open catalog on context close"
                    );
                }
            }
        }

        lock_live_tags().remove(&self.stream_tag);
    }
}

/// Write handle over one container file.
pub struct Writer {
    container: Container,
    db_path: PathBuf,
    auto_reclaim: bool,
}

impl Writer {
    /// Opens a container for writing.
    ///
    /// Validates the header, upgrades the catalog schema if needed, and
    /// runs the recovery scan over every block binding a crash left open.
    pub fn open(path: impl AsRef<Path>, auto_reclaim: bool) -> Result<Self> {
        let container = Container::open(path, true)?;
        let db_path = catalog_path(container.path());

        let mut catalog = Catalog::open(&db_path, true)?;
        catalog.upgrade()?;
        Self::recover_open_blocks(&container, &mut catalog)?;

        Ok(Self {
            container,
            db_path,
            auto_reclaim,
        })
    }

    /// Repairs blocks whose bindings were never finalized.
    ///
    /// The block memory is made consistent (count lowered, flushed) inside
    /// [`BlockMut::recover`] before the catalog learns the end timestamp.
    /// Bindings with no recoverable frame are left open; their blocks are
    /// recycled whenever a writer next claims them.
    fn recover_open_blocks(container: &Container, catalog: &mut Catalog) -> Result<()> {
        for row in catalog.open_segment_blocks()? {
            if row.block_idx >= container.n_blocks() {
                return Err(StoreError::Unknown(format!(
                    "segment block {} references block index {} beyond container ({} blocks)",
                    row.id,
                    row.block_idx,
                    container.n_blocks()
                )));
            }
            let mut block = BlockMut::map(container, row.block_idx)?;
            if let Some(end_timestamp) = block.recover(&row.uuid)? {
                catalog.finalize_segment_block(row.id, end_timestamp)?;
                debug!(
                    segment_block_id = row.id,
                    block_idx = row.block_idx,
                    end_timestamp,
                    "recovered open block"
                );
            }
        }
        Ok(())
    }

    /// Creates a write context for `stream_tag`.
    ///
    /// # Errors
    ///
    /// `DuplicateStreamTag` when another live context in this process
    /// already holds the tag; `UnableToCreateSegment` when the catalog
    /// insert fails.
    pub fn create_write_context(
        &self,
        stream_tag: &str,
        metadata: &str,
    ) -> Result<WriteContext> {
        if stream_tag.is_empty() {
            return Err(StoreError::InvalidArgument(
                "stream tag must not be empty".to_string(),
            ));
        }

        let mut tags = lock_live_tags();
        if tags.contains(stream_tag) {
            return Err(StoreError::DuplicateStreamTag(stream_tag.to_string()));
        }

        let mut catalog = Catalog::open(&self.db_path, true)?;
        let segment_id = catalog.create_segment(stream_tag, metadata)?;
        tags.insert(stream_tag.to_string());

        Ok(WriteContext {
            stream_tag: stream_tag.to_string(),
            metadata: metadata.to_string(),
            segment_id,
            next_sequence: 0,
            last_timestamp: None,
            current: None,
            db_path: self.db_path.clone(),
        })
    }

    /// Appends one frame to the context's stream.
    ///
    /// Timestamps must strictly increase within a context; the first one
    /// only has to be non-negative. When the current block cannot take
    /// the frame, it is flushed and finalized and the frame retries on a
    /// freshly acquired block.
    ///
    /// # Errors
    ///
    /// `NON_MONOTONIC_TIMESTAMP`, `ROW_SIZE_TOO_BIG`, `NO_FREE_BLOCKS`
    /// (container full, auto-reclaim off), and catalog failures from the
    /// rollover path. All of them leave the context consistent: the
    /// current block, when bound, stays open for further appends.
    pub fn write(
        &self,
        ctx: &mut WriteContext,
        payload: &[u8],
        timestamp: Timestamp,
        flags: u8,
    ) -> Result<()> {
        match ctx.last_timestamp {
            Some(last) if timestamp <= last => {
                return Err(StoreError::NonMonotonicTimestamp { timestamp, last });
            }
            None if timestamp < 0 => {
                return Err(StoreError::InvalidArgument(format!(
                    "first timestamp must be non-negative, got {timestamp}"
                )));
            }
            _ => {}
        }

        let max = max_payload(self.container.block_size());
        if payload.len() > max {
            return Err(StoreError::RowSizeTooBig {
                size: payload.len(),
                max,
            });
        }

        loop {
            let Some(current) = ctx.current.as_mut() else {
                // Lazy block acquisition: reserve (or reclaim) a block and
                // bind it to the segment in one catalog transaction, then
                // prepare its memory.
                let mut catalog = Catalog::open(&self.db_path, true)?;
                let uuid = Uuid::new_v4();
                let row = catalog.bind_new_block(
                    self.auto_reclaim,
                    ctx.segment_id,
                    ctx.next_sequence,
                    timestamp,
                    uuid,
                )?;
                ctx.next_sequence += 1;

                let mut block = BlockMut::map(&self.container, row.block_idx)?;
                block.recycle(timestamp)?;
                ctx.current = Some(CurrentBlock {
                    segment_block_id: row.id,
                    uuid,
                    block,
                });
                continue;
            };

            match current.block.append(&current.uuid, payload, timestamp, flags) {
                AppendOutcome::Appended => {
                    ctx.last_timestamp = Some(timestamp);
                    return Ok(());
                }
                AppendOutcome::BlockFull => {
                    if current.block.n_valid() == 0 {
                        // A size-checked frame always fits an empty block.
                        return Err(StoreError::Unknown(
                            "empty block rejected a size-checked frame".to_string(),
                        ));
                    }
                    let last = ctx.last_timestamp.ok_or_else(|| {
                        StoreError::Unknown("rollover on a context with no appends".to_string())
                    })?;

                    current.block.flush_all()?;
                    let mut catalog = Catalog::open(&self.db_path, true)?;
                    catalog.finalize_segment_block(current.segment_block_id, last)?;

                    debug!(
                        stream_tag = %ctx.stream_tag,
                        sequence = ctx.next_sequence - 1,
                        end_timestamp = last,
                        "block rolled over"
                    );
                    ctx.current = None;
                }
            }
        }
    }

    /// Frees every finalized block of `stream_tag` wholly contained in
    /// `[lo, hi]`, transactionally. Partial overlaps are not supported
    /// and are left untouched.
    pub fn free_blocks(&self, stream_tag: &str, lo: Timestamp, hi: Timestamp) -> Result<usize> {
        if lo > hi {
            return Err(StoreError::InvalidArgument(format!(
                "invalid range: {lo} > {hi}"
            )));
        }
        let mut catalog = Catalog::open(&self.db_path, true)?;
        catalog.free_blocks(stream_tag, lo, hi)
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
