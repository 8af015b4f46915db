//! Memory-mapped block engine.
//!
//! A block is a fixed-size region of the container file laid out as:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Block Header (16 bytes)                                     │
//! │  - Start Timestamp: i64 (8 bytes)                            │
//! │  - Committed Count: u32, release/acquire atomic (4 bytes)    │
//! │  - Reserved: u32 (4 bytes)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Index Entries, growing forward (16 bytes each)              │
//! │  - Timestamp: i64, Frame Offset: u64                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ...free space...                                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Frames, growing backward (8-byte aligned)                   │
//! │  - UUID: 16 bytes, Payload Size: u32, Flags: u8, Payload     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The committed count is the single point of cross-thread communication:
//! the one producer appends a frame, writes its index entry, then
//! increments the count with release ordering. A reader that observes `k`
//! through an acquire load sees every byte of slots `[0, k)` and the
//! frames they reference. No other synchronization exists on the append
//! path.
//!
//! Frames carry the 16-byte tag of the block binding that wrote them;
//! bytes left behind by a previous tenant of the block fail the tag
//! comparison and are invisible. Recycling a freshly reserved block zeros
//! the count and the stale index region and flushes synchronously, so a
//! crash mid-life can never resurface a prior tenant's index.

use crate::error::Result;
use crate::layout::{
    padded_frame_size, Container, Timestamp, BLOCK_HEADER_SIZE, FRAME_HEADER_SIZE, INDEX_ENTRY_SIZE,
};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// Byte offset of the committed-count word within a block.
const COUNTER_OFFSET: usize = 8;

/// Outcome of a single append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The frame and its index entry were committed.
    Appended,
    /// Placing the frame would collide with the index region; the caller
    /// must roll over to a fresh block.
    BlockFull,
}

/// Largest slot count a block of the given size can physically hold.
fn index_capacity(block_size: u32) -> u32 {
    (block_size - BLOCK_HEADER_SIZE) / INDEX_ENTRY_SIZE
}

/// Reads the index entry at `slot` from a mapped block.
fn read_index_entry(block: &[u8], slot: u32) -> (Timestamp, u64) {
    let at = (BLOCK_HEADER_SIZE + slot * INDEX_ENTRY_SIZE) as usize;
    let timestamp = i64::from_le_bytes(block[at..at + 8].try_into().unwrap());
    let offset = u64::from_le_bytes(block[at + 8..at + 16].try_into().unwrap());
    (timestamp, offset)
}

/// Validates the frame header at `offset` against the expected block tag.
///
/// Returns `(payload_size, flags)` when the 16-byte tag matches and the
/// declared payload fits the space remaining behind the header. Frames in
/// the gap between a torn append and the next recycle fail here and are
/// treated as absent.
fn validate_frame(block: &[u8], offset: u64, expected_uuid: &Uuid) -> Option<(u32, u8)> {
    let block_size = block.len() as u64;
    if offset > block_size - FRAME_HEADER_SIZE as u64 {
        return None;
    }
    let at = offset as usize;
    if block[at..at + 16] != expected_uuid.as_bytes()[..] {
        return None;
    }
    let size = u32::from_le_bytes(block[at + 16..at + 20].try_into().unwrap());
    if size as u64 > block_size - offset - FRAME_HEADER_SIZE as u64 {
        return None;
    }
    Some((size, block[at + 20]))
}

/// Lower-bound binary search over the first `n` index slots by timestamp.
///
/// Returns the first slot whose timestamp is `>= target`, or `n` when all
/// committed timestamps are smaller.
fn lower_bound(block: &[u8], n: u32, target: Timestamp) -> u32 {
    let mut lo = 0u32;
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let (timestamp, _) = read_index_entry(block, mid);
        if timestamp < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// A committed frame resolved from a read-side mapping.
#[derive(Debug, Clone, Copy)]
pub struct FrameRef<'a> {
    /// Frame payload bytes.
    pub payload: &'a [u8],
    /// Caller-defined flags byte, read verbatim.
    pub flags: u8,
}

/// The writer's exclusive read-write mapping of one block.
///
/// At most one `BlockMut` exists per block at any time; the catalog's
/// `reserved` status plus the process-wide live-tag set enforce this.
pub struct BlockMut {
    mm: MmapMut,
    block_size: u32,
}

impl std::fmt::Debug for BlockMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMut")
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl BlockMut {
    /// Maps block `idx` of the container read-write.
    pub fn map(container: &Container, idx: u32) -> Result<Self> {
        let block_size = container.block_size();
        // Safety: the region lies wholly inside the preallocated file and
        // starts on a mapping-granularity boundary.
        let mm = unsafe {
            MmapOptions::new()
                .offset(container.block_offset(idx))
                .len(block_size as usize)
                .map_mut(container.file())?
        };
        Ok(Self { mm, block_size })
    }

    fn counter(&self) -> &AtomicU32 {
        // Safety: the word lives at a fixed 4-byte-aligned offset inside
        // the mapping and is only ever accessed atomically.
        unsafe { &*(self.mm.as_ptr().add(COUNTER_OFFSET) as *const AtomicU32) }
    }

    /// Committed frame count. The caller is the only producer, so a
    /// relaxed load suffices.
    pub fn n_valid(&self) -> u32 {
        self.counter()
            .load(Ordering::Relaxed)
            .min(index_capacity(self.block_size))
    }

    /// Prepares a freshly reserved block for a new life.
    ///
    /// Stores the first frame's timestamp, publishes a zero committed
    /// count with release ordering, zeros the reserved word and the stale
    /// index region, and flushes the lot synchronously. The flush is the
    /// block's durability point: after it, no reader can observe index
    /// entries from the previous tenant, even across a crash.
    pub fn recycle(&mut self, first_timestamp: Timestamp) -> Result<()> {
        self.mm[0..8].copy_from_slice(&first_timestamp.to_le_bytes());

        let stale = self.counter().load(Ordering::Relaxed);
        self.counter().store(0, Ordering::Release);

        self.mm[12..16].copy_from_slice(&[0u8; 4]);

        let stale_clamped = stale.min(index_capacity(self.block_size));
        let index_end = (BLOCK_HEADER_SIZE + stale_clamped * INDEX_ENTRY_SIZE) as usize;
        self.mm[BLOCK_HEADER_SIZE as usize..index_end].fill(0);

        self.mm.flush_range(0, index_end)?;
        Ok(())
    }

    /// Appends one frame under the single-producer protocol.
    ///
    /// The frame bytes and the index entry are written first; the
    /// release-ordered counter increment publishes both. Returns
    /// [`AppendOutcome::BlockFull`] when the padded frame would underflow
    /// the frame region or cross into the projected index region end.
    pub fn append(
        &mut self,
        uuid: &Uuid,
        payload: &[u8],
        timestamp: Timestamp,
        flags: u8,
    ) -> AppendOutcome {
        let n = self.n_valid();
        let index_end = (BLOCK_HEADER_SIZE + (n + 1) * INDEX_ENTRY_SIZE) as u64;
        let padded = padded_frame_size(payload.len());
        if padded > self.block_size as u64 {
            return AppendOutcome::BlockFull;
        }

        let offset = if n == 0 {
            self.block_size as u64 - padded
        } else {
            let (_, last_offset) = read_index_entry(&self.mm, n - 1);
            if last_offset < padded {
                return AppendOutcome::BlockFull;
            }
            last_offset - padded
        };
        if offset < index_end {
            return AppendOutcome::BlockFull;
        }

        let at = offset as usize;
        self.mm[at..at + 16].copy_from_slice(uuid.as_bytes());
        self.mm[at + 16..at + 20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.mm[at + 20] = flags;
        self.mm[at + FRAME_HEADER_SIZE as usize..at + FRAME_HEADER_SIZE as usize + payload.len()]
            .copy_from_slice(payload);

        let slot = (BLOCK_HEADER_SIZE + n * INDEX_ENTRY_SIZE) as usize;
        self.mm[slot..slot + 8].copy_from_slice(&timestamp.to_le_bytes());
        self.mm[slot + 8..slot + 16].copy_from_slice(&offset.to_le_bytes());

        self.counter().fetch_add(1, Ordering::Release);
        AppendOutcome::Appended
    }

    /// Flushes the whole block synchronously. Called once at rollover,
    /// before the catalog finalizes the block.
    pub fn flush_all(&self) -> Result<()> {
        self.mm.flush()?;
        Ok(())
    }

    /// Repairs a block left open by a crash.
    ///
    /// Scans from the last claimed slot downward for the newest slot whose
    /// entry is nonzero, whose offset lies inside the valid frame region,
    /// and whose frame validates against `uuid`. When the claimed count
    /// overstates the committed count, the count is lowered and flushed
    /// *before* the caller touches the catalog, so the memory is
    /// consistent by the time the catalog says anything about it.
    ///
    /// Returns the last committed timestamp, or `None` when no slot
    /// validates (the block is left untouched; its next writer recycles
    /// it). Running the scan twice is a no-op the second time.
    pub fn recover(&mut self, uuid: &Uuid) -> Result<Option<Timestamp>> {
        let n = self
            .counter()
            .load(Ordering::Acquire)
            .min(index_capacity(self.block_size));
        let index_region_end = (BLOCK_HEADER_SIZE + (n + 1) * INDEX_ENTRY_SIZE) as u64;

        let mut last_valid: Option<u32> = None;
        for slot in (0..n).rev() {
            let (timestamp, offset) = read_index_entry(&self.mm, slot);
            if timestamp == 0 || offset == 0 {
                continue;
            }
            if offset < index_region_end
                || offset > (self.block_size - FRAME_HEADER_SIZE) as u64
            {
                continue;
            }
            if validate_frame(&self.mm, offset, uuid).is_none() {
                continue;
            }
            last_valid = Some(slot);
            break;
        }

        let Some(slot) = last_valid else {
            return Ok(None);
        };

        if slot + 1 < n {
            warn!(
                claimed = n,
                committed = slot + 1,
                "truncating torn appends during recovery"
            );
            self.counter().store(slot + 1, Ordering::Relaxed);
            let index_end = (BLOCK_HEADER_SIZE + n * INDEX_ENTRY_SIZE) as usize;
            self.mm.flush_range(0, index_end)?;
        } else {
            debug!(committed = n, "block clean after recovery scan");
        }

        let (timestamp, _) = read_index_entry(&self.mm, slot);
        Ok(Some(timestamp))
    }
}

/// A shared read-only mapping of one block.
///
/// Any number of `BlockView`s may exist for a block, including one a
/// writer is appending to; the acquire load of the committed count bounds
/// what they may read.
pub struct BlockView {
    mm: Mmap,
    block_size: u32,
}

impl BlockView {
    /// Maps block `idx` of the container read-only.
    pub fn map(container: &Container, idx: u32) -> Result<Self> {
        let block_size = container.block_size();
        // Safety: the region lies wholly inside the preallocated file and
        // starts on a mapping-granularity boundary.
        let mm = unsafe {
            MmapOptions::new()
                .offset(container.block_offset(idx))
                .len(block_size as usize)
                .map(container.file())?
        };
        Ok(Self { mm, block_size })
    }

    /// Committed frame count with acquire ordering: every slot below the
    /// returned value, and the frame it references, is fully visible.
    pub fn n_valid(&self) -> u32 {
        let counter =
            // Safety: same fixed, aligned word as on the write side; this
            // side only ever loads.
            unsafe { &*(self.mm.as_ptr().add(COUNTER_OFFSET) as *const AtomicU32) };
        counter
            .load(Ordering::Acquire)
            .min(index_capacity(self.block_size))
    }

    /// Timestamp of the first frame written in this block's current life.
    pub fn start_timestamp(&self) -> Timestamp {
        i64::from_le_bytes(self.mm[0..8].try_into().unwrap())
    }

    /// Reads the index entry at `slot`. The slot must be below a count
    /// previously returned by [`BlockView::n_valid`].
    pub fn index_entry(&self, slot: u32) -> (Timestamp, u64) {
        read_index_entry(&self.mm, slot)
    }

    /// Resolves and validates the frame at `offset`.
    ///
    /// Returns `None` for frames failing the tag-and-size predicate;
    /// readers skip those silently.
    pub fn frame(&self, offset: u64, expected_uuid: &Uuid) -> Option<FrameRef<'_>> {
        let (size, flags) = validate_frame(&self.mm, offset, expected_uuid)?;
        let at = offset as usize + FRAME_HEADER_SIZE as usize;
        Some(FrameRef {
            payload: &self.mm[at..at + size as usize],
            flags,
        })
    }

    /// First slot among the first `n` whose timestamp is `>= target`.
    pub fn lower_bound(&self, n: u32, target: Timestamp) -> u32 {
        lower_bound(&self.mm, n, target)
    }
}
