//! Metadata catalog: the relational sidecar mapping streams to blocks.
//!
//! The catalog is a small SQLite database living next to the container
//! file. It holds three tables:
//!
//! - `blocks`: one row per physical block with its lifecycle status
//!   (`free`, `reserved`, `used`) and reservation time
//! - `segments`: one row per write context (a contiguous writer session
//!   for one stream)
//! - `segment_blocks`: bindings between a segment and the blocks it has
//!   filled, ordered by a per-segment `sequence`; `end_timestamp = 0`
//!   marks a block that is still open for appends
//!
//! A trigger garbage-collects segments once their last `segment_block` row
//! disappears, so streams vanish from the catalog when their data does.
//!
//! Every multi-statement mutation runs inside a transaction; readers open
//! the database read-only and never mutate it. Connections use WAL journal
//! mode (read-write side), a 2 s busy timeout, and a bounded open retry
//! with linear backoff so short-lived writer/reader races resolve without
//! surfacing errors.

use crate::error::{Result, StoreError};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long a single catalog statement waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Attempts made to open the catalog before giving up.
const OPEN_RETRIES: u32 = 5;

/// Base sleep between open attempts; grows linearly per attempt.
const OPEN_RETRY_BASE: Duration = Duration::from_millis(500);

/// Reservations older than this are swept from `reserved` to `used`.
const STALE_RESERVATION_SECS: u32 = 10;

/// Current catalog schema version.
const SCHEMA_VERSION: i32 = 1;

/// A physical block handed to a writer: catalog id plus file position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Catalog row id.
    pub id: i64,
    /// Stable position of the block within the container file.
    pub idx: u32,
}

/// One `segment_blocks` row joined with its segment's metadata.
#[derive(Debug, Clone)]
pub struct SegmentBlockRow {
    /// Catalog row id.
    pub id: i64,
    /// Owning segment.
    pub segment_id: i64,
    /// Per-segment monotonic sequence number.
    pub sequence: i64,
    /// Underlying block's catalog id.
    pub block_id: i64,
    /// Underlying block's position in the container file.
    pub block_idx: u32,
    /// Timestamp of the first frame written to the block.
    pub start_timestamp: i64,
    /// Timestamp of the last frame, or 0 while the block is open.
    pub end_timestamp: i64,
    /// Per-block validation tag.
    pub uuid: Uuid,
    /// The owning segment's caller-supplied metadata.
    pub metadata: String,
}

impl SegmentBlockRow {
    /// Returns true while the block is still open for appends.
    pub fn is_open(&self) -> bool {
        self.end_timestamp == 0
    }
}

/// A maximal run of consecutive-sequence blocks within one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousRegion {
    /// Segment the region belongs to.
    pub segment_id: i64,
    /// Earliest start timestamp in the region.
    pub start_timestamp: i64,
    /// Latest end timestamp in the region.
    pub end_timestamp: i64,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE blocks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        idx INTEGER,
        status TEXT,
        reserved_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE segments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream_tag TEXT,
        metadata TEXT
    )",
    "CREATE TABLE segment_blocks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        segment_id INTEGER REFERENCES segments(id),
        sequence INTEGER,
        block_id INTEGER REFERENCES blocks(id),
        block_idx INTEGER,
        start_timestamp INTEGER,
        end_timestamp INTEGER,
        uuid TEXT
    )",
    "CREATE TRIGGER delete_empty_segments
     AFTER DELETE ON segment_blocks
     BEGIN
        DELETE FROM segments
        WHERE id = OLD.segment_id
        AND NOT EXISTS (
            SELECT 1 FROM segment_blocks WHERE segment_id = OLD.segment_id
        );
     END",
    "CREATE INDEX idx_segment_blocks_segment_id ON segment_blocks(segment_id)",
    "CREATE INDEX idx_segment_blocks_time_range ON segment_blocks(start_timestamp)",
    "CREATE INDEX idx_segments_stream_tag ON segments(stream_tag)",
    "CREATE INDEX idx_blocks_status ON blocks(status)",
];

const SEGMENT_BLOCK_COLUMNS: &str = "sb.id, sb.segment_id, sb.sequence, sb.block_id, \
     sb.block_idx, sb.start_timestamp, sb.end_timestamp, sb.uuid, s.metadata";

fn segment_block_from_row(row: &Row<'_>) -> rusqlite::Result<SegmentBlockRow> {
    let uuid_text: String = row.get(7)?;
    let uuid = Uuid::parse_str(&uuid_text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(SegmentBlockRow {
        id: row.get(0)?,
        segment_id: row.get(1)?,
        sequence: row.get(2)?,
        block_id: row.get(3)?,
        block_idx: row.get(4)?,
        start_timestamp: row.get(5)?,
        end_timestamp: row.get(6)?,
        uuid,
        metadata: row.get(8)?,
    })
}

/// Handle to the catalog database.
///
/// Each `Writer`, `Reader`, and iterator owns its own connection; the
/// connection closes when the handle drops.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Creates a fresh catalog at `path` with `n_blocks` free block rows.
    ///
    /// Installs the schema, populates `blocks`, and stamps the schema
    /// version. The caller removes any stale database first.
    pub fn create(path: &Path, n_blocks: u32) -> Result<()> {
        let mut catalog = Self::open(path, true)?;

        for stmt in SCHEMA {
            catalog.conn.execute(stmt, [])?;
        }

        let tx = catalog.conn.transaction()?;
        {
            let mut insert = tx.prepare("INSERT INTO blocks (idx, status) VALUES (?1, 'free')")?;
            for idx in 0..n_blocks {
                insert.execute(params![idx])?;
            }
        }
        tx.commit()?;

        catalog.upgrade()?;
        Ok(())
    }

    /// Opens the catalog, retrying with linear backoff on failure.
    ///
    /// Read-write connections enable WAL journal mode; all connections get
    /// the 2 s busy timeout.
    pub fn open(path: &Path, read_write: bool) -> Result<Self> {
        let flags = if read_write {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let mut attempt = 0;
        loop {
            match Connection::open_with_flags(path, flags) {
                Ok(conn) => {
                    conn.busy_timeout(BUSY_TIMEOUT)?;
                    if read_write {
                        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
                    }
                    return Ok(Self { conn });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= OPEN_RETRIES {
                        return Err(StoreError::CantOpen {
                            path: path.display().to_string(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "catalog open failed, retrying"
                    );
                    std::thread::sleep(OPEN_RETRY_BASE * attempt);
                }
            }
        }
    }

    /// Runs pending schema upgrades, stepping `user_version` monotonically.
    pub fn upgrade(&self) -> Result<()> {
        let version = self.user_version()?;
        if version < SCHEMA_VERSION {
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
            debug!(from = version, to = SCHEMA_VERSION, "catalog upgraded");
        }
        Ok(())
    }

    fn user_version(&self) -> Result<i32> {
        let version = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(version)
    }

    /// Reserves one `free` block, stamping a fresh reservation time.
    ///
    /// Runs within the caller's implicit statement scope; used by
    /// [`Catalog::bind_new_block`] inside its transaction.
    fn reserve_free_block(conn: &Connection) -> Result<Option<BlockHandle>> {
        let found = conn
            .query_row(
                "SELECT id, idx FROM blocks WHERE status = 'free' LIMIT 1",
                [],
                |row| {
                    Ok(BlockHandle {
                        id: row.get(0)?,
                        idx: row.get(1)?,
                    })
                },
            )
            .optional()?;

        if let Some(block) = &found {
            conn.execute(
                "UPDATE blocks SET status = 'reserved', reserved_at = CURRENT_TIMESTAMP \
                 WHERE id = ?1",
                params![block.id],
            )?;
        }
        Ok(found)
    }

    /// Reclaims the oldest finalized block: smallest nonzero end timestamp,
    /// ties broken by oldest reservation.
    ///
    /// Deletes the binding (the trigger may drop an emptied segment) and
    /// re-reserves the block.
    fn reclaim_oldest(conn: &Connection) -> Result<Option<BlockHandle>> {
        let found = conn
            .query_row(
                "SELECT sb.id, sb.block_id, b.idx \
                 FROM segment_blocks sb \
                 JOIN blocks b ON sb.block_id = b.id \
                 WHERE sb.end_timestamp != 0 \
                   AND (b.status = 'used' OR b.status = 'reserved') \
                 ORDER BY sb.end_timestamp ASC, b.reserved_at ASC \
                 LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((segment_block_id, block_id, idx)) = found else {
            return Ok(None);
        };

        conn.execute(
            "DELETE FROM segment_blocks WHERE id = ?1",
            params![segment_block_id],
        )?;
        conn.execute(
            "UPDATE blocks SET status = 'reserved', reserved_at = CURRENT_TIMESTAMP \
             WHERE id = ?1",
            params![block_id],
        )?;

        debug!(block_id, segment_block_id, "reclaimed oldest block");
        Ok(Some(BlockHandle { id: block_id, idx }))
    }

    /// Acquires a block and binds it to a segment, in one transaction.
    ///
    /// Tries a free block first; when none exists and `auto_reclaim` is
    /// set, the oldest finalized block is evicted and reused.
    ///
    /// # Errors
    ///
    /// `NoFreeBlocks` when the container is full and reclamation is
    /// disabled (or nothing is reclaimable);
    /// `UnableToCreateSegmentBlock` when the binding insert fails.
    pub fn bind_new_block(
        &mut self,
        auto_reclaim: bool,
        segment_id: i64,
        sequence: i64,
        start_timestamp: i64,
        uuid: Uuid,
    ) -> Result<SegmentBlockRow> {
        let tx = self.conn.transaction()?;

        let block = match Self::reserve_free_block(&tx)? {
            Some(block) => block,
            None if auto_reclaim => Self::reclaim_oldest(&tx)?.ok_or(StoreError::NoFreeBlocks)?,
            None => return Err(StoreError::NoFreeBlocks),
        };

        tx.execute(
            "INSERT INTO segment_blocks \
             (segment_id, sequence, block_id, block_idx, start_timestamp, end_timestamp, uuid) \
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                segment_id,
                sequence,
                block.id,
                block.idx,
                start_timestamp,
                uuid.to_string()
            ],
        )
        .map_err(|e| StoreError::UnableToCreateSegmentBlock(e.to_string()))?;
        let id = tx.last_insert_rowid();

        tx.commit()?;

        Ok(SegmentBlockRow {
            id,
            segment_id,
            sequence,
            block_id: block.id,
            block_idx: block.idx,
            start_timestamp,
            end_timestamp: 0,
            uuid,
            metadata: String::new(),
        })
    }

    /// Inserts a segment row for a new write context.
    pub fn create_segment(&mut self, stream_tag: &str, metadata: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO segments (stream_tag, metadata) VALUES (?1, ?2)",
                params![stream_tag, metadata],
            )
            .map_err(|e| StoreError::UnableToCreateSegment(e.to_string()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Closes a block for appends by recording its final timestamp.
    pub fn finalize_segment_block(&mut self, id: i64, end_timestamp: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE segment_blocks SET end_timestamp = ?1 WHERE id = ?2",
            params![end_timestamp, id],
        )?;
        Ok(())
    }

    /// Finalizes a block and sweeps stale reservations, in one transaction.
    ///
    /// Context teardown path: the sweep piggybacks on the finalize so no
    /// background thread is needed.
    pub fn finalize_and_sweep(&mut self, id: i64, end_timestamp: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE segment_blocks SET end_timestamp = ?1 WHERE id = ?2",
            params![end_timestamp, id],
        )?;
        Self::promote_stale_reserved_inner(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Promotes reservations older than ten seconds to `used`.
    pub fn promote_stale_reserved(&self) -> Result<usize> {
        Self::promote_stale_reserved_inner(&self.conn)
    }

    fn promote_stale_reserved_inner(conn: &Connection) -> Result<usize> {
        let promoted = conn.execute(
            &format!(
                "UPDATE blocks SET status = 'used' WHERE status = 'reserved' \
                 AND reserved_at < datetime('now', '-{STALE_RESERVATION_SECS} seconds')"
            ),
            [],
        )?;
        Ok(promoted)
    }

    /// Frees every finalized block wholly contained in `[lo, hi]` for the
    /// stream, transactionally.
    ///
    /// Bindings are deleted (emptied segments fall to the trigger) and the
    /// underlying blocks return to `free`. Partially overlapping blocks
    /// are left alone. Returns the number of blocks freed.
    pub fn free_blocks(&mut self, stream_tag: &str, lo: i64, hi: i64) -> Result<usize> {
        let tx = self.conn.transaction()?;

        let targets: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT sb.id, sb.block_id \
                 FROM segment_blocks sb \
                 JOIN segments s ON sb.segment_id = s.id \
                 WHERE s.stream_tag = ?1 \
                   AND sb.start_timestamp >= ?2 \
                   AND sb.end_timestamp <= ?3 \
                   AND sb.end_timestamp != 0",
            )?;
            let rows = stmt.query_map(params![stream_tag, lo, hi], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for &(segment_block_id, block_id) in &targets {
            tx.execute(
                "DELETE FROM segment_blocks WHERE id = ?1",
                params![segment_block_id],
            )?;
            tx.execute(
                "UPDATE blocks SET status = 'free' WHERE id = ?1",
                params![block_id],
            )?;
        }

        tx.commit()?;
        debug!(stream_tag, lo, hi, freed = targets.len(), "freed blocks");
        Ok(targets.len())
    }

    /// Lists every still-open block binding, for the recovery scan.
    pub fn open_segment_blocks(&self) -> Result<Vec<SegmentBlockRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SEGMENT_BLOCK_COLUMNS} \
             FROM segment_blocks sb \
             JOIN segments s ON sb.segment_id = s.id \
             WHERE sb.end_timestamp = 0"
        ))?;
        let rows = stmt.query_map([], segment_block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Lists block bindings for a stream intersecting `[lo, hi]`, ordered
    /// by sequence.
    ///
    /// Open blocks (`end_timestamp = 0`) always intersect.
    pub fn blocks_in_range(
        &self,
        stream_tag: &str,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<SegmentBlockRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SEGMENT_BLOCK_COLUMNS} \
             FROM segment_blocks sb \
             JOIN segments s ON sb.segment_id = s.id \
             WHERE s.stream_tag = ?1 \
               AND sb.start_timestamp <= ?2 \
               AND (sb.end_timestamp >= ?3 OR sb.end_timestamp = 0) \
             ORDER BY sb.sequence ASC"
        ))?;
        let rows = stmt.query_map(params![stream_tag, hi, lo], segment_block_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Returns the first block of the stream's earliest segment.
    pub fn first_block(&self, stream_tag: &str) -> Result<Option<SegmentBlockRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE s.stream_tag = ?1 \
                     ORDER BY s.id ASC, sb.sequence ASC \
                     LIMIT 1"
                ),
                params![stream_tag],
                segment_block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Looks up one binding by `(segment_id, sequence)`.
    pub fn block_at(&self, segment_id: i64, sequence: i64) -> Result<Option<SegmentBlockRow>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE sb.segment_id = ?1 AND sb.sequence = ?2"
                ),
                params![segment_id, sequence],
                segment_block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Returns the binding after `(segment_id, sequence)` in stream order.
    ///
    /// Falls through to the first block of the stream's next segment when
    /// the current segment is exhausted.
    pub fn next_block(
        &self,
        stream_tag: &str,
        segment_id: i64,
        sequence: i64,
    ) -> Result<Option<SegmentBlockRow>> {
        let within = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE sb.segment_id = ?1 AND sb.sequence > ?2 \
                     ORDER BY sb.sequence ASC \
                     LIMIT 1"
                ),
                params![segment_id, sequence],
                segment_block_from_row,
            )
            .optional()?;
        if within.is_some() {
            return Ok(within);
        }

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE s.stream_tag = ?1 AND s.id > ?2 \
                     ORDER BY s.id ASC, sb.sequence ASC \
                     LIMIT 1"
                ),
                params![stream_tag, segment_id],
                segment_block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Returns the binding before `(segment_id, sequence)` in stream order.
    ///
    /// Falls through to the last block of the stream's previous segment.
    pub fn prev_block(
        &self,
        stream_tag: &str,
        segment_id: i64,
        sequence: i64,
    ) -> Result<Option<SegmentBlockRow>> {
        let within = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE sb.segment_id = ?1 AND sb.sequence < ?2 \
                     ORDER BY sb.sequence DESC \
                     LIMIT 1"
                ),
                params![segment_id, sequence],
                segment_block_from_row,
            )
            .optional()?;
        if within.is_some() {
            return Ok(within);
        }

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE s.stream_tag = ?1 AND s.id < ?2 \
                     ORDER BY s.id DESC, sb.sequence DESC \
                     LIMIT 1"
                ),
                params![stream_tag, segment_id],
                segment_block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Finds the block whose time span contains `timestamp`, or the first
    /// block starting at or after it.
    ///
    /// The fallback lets a seek before the stream's first frame land on
    /// the first block instead of failing.
    pub fn block_for_timestamp(
        &self,
        stream_tag: &str,
        timestamp: i64,
    ) -> Result<Option<SegmentBlockRow>> {
        let containing = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE s.stream_tag = ?1 \
                       AND sb.start_timestamp <= ?2 \
                       AND (sb.end_timestamp >= ?2 OR sb.end_timestamp = 0) \
                     ORDER BY s.id ASC, sb.sequence ASC \
                     LIMIT 1"
                ),
                params![stream_tag, timestamp],
                segment_block_from_row,
            )
            .optional()?;
        if containing.is_some() {
            return Ok(containing);
        }

        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_BLOCK_COLUMNS} \
                     FROM segment_blocks sb \
                     JOIN segments s ON sb.segment_id = s.id \
                     WHERE s.stream_tag = ?1 AND sb.start_timestamp >= ?2 \
                     ORDER BY s.id ASC, sb.sequence ASC \
                     LIMIT 1"
                ),
                params![stream_tag, timestamp],
                segment_block_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Lists distinct stream tags with at least one block intersecting
    /// `[lo, hi]`.
    pub fn stream_tags_in_range(&self, lo: i64, hi: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.stream_tag \
             FROM segments s \
             JOIN segment_blocks sb ON s.id = sb.segment_id \
             WHERE sb.start_timestamp <= ?1 \
               AND (sb.end_timestamp >= ?2 OR sb.end_timestamp = 0)",
        )?;
        let rows = stmt.query_map(params![hi, lo], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Groups a stream's blocks intersecting `[lo, hi]` into contiguous
    /// regions.
    ///
    /// Consecutive sequences within one segment share a group key
    /// (`row_number() - sequence`); each group reports its min start and
    /// max end timestamp.
    pub fn contiguous_regions(
        &self,
        stream_tag: &str,
        lo: i64,
        hi: i64,
    ) -> Result<Vec<ContiguousRegion>> {
        let mut stmt = self.conn.prepare(
            "WITH contiguous_groups AS ( \
                 SELECT sb.segment_id, sb.sequence, sb.start_timestamp, sb.end_timestamp, \
                        ROW_NUMBER() OVER (PARTITION BY sb.segment_id ORDER BY sb.sequence) \
                            - sb.sequence AS group_key \
                 FROM segment_blocks sb \
                 JOIN segments s ON sb.segment_id = s.id \
                 WHERE sb.start_timestamp <= ?1 \
                   AND (sb.end_timestamp >= ?2 OR sb.end_timestamp = 0) \
                   AND s.stream_tag = ?3 \
             ) \
             SELECT segment_id, MIN(start_timestamp) AS region_start, \
                    MAX(end_timestamp) AS region_end \
             FROM contiguous_groups \
             GROUP BY segment_id, group_key \
             ORDER BY segment_id, region_start",
        )?;
        let rows = stmt.query_map(params![hi, lo, stream_tag], |row| {
            Ok(ContiguousRegion {
                segment_id: row.get(0)?,
                start_timestamp: row.get(1)?,
                end_timestamp: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_catalog(n_blocks: u32) -> (TempDir, Catalog) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.db");
        Catalog::create(&path, n_blocks).unwrap();
        let catalog = Catalog::open(&path, true).unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_create_populates_free_blocks() {
        let (_dir, catalog) = fresh_catalog(8);
        let free: i64 = catalog
            .conn
            .query_row(
                "SELECT COUNT(*) FROM blocks WHERE status = 'free'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(free, 8);
        assert_eq!(catalog.user_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_bind_new_block_reserves() {
        let (_dir, mut catalog) = fresh_catalog(2);
        let segment_id = catalog.create_segment("cam-1", "{}").unwrap();

        let bound = catalog
            .bind_new_block(false, segment_id, 0, 1000, Uuid::new_v4())
            .unwrap();
        assert_eq!(bound.start_timestamp, 1000);
        assert!(bound.is_open());

        let reserved: i64 = catalog
            .conn
            .query_row(
                "SELECT COUNT(*) FROM blocks WHERE status = 'reserved'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(reserved, 1);
    }

    #[test]
    fn test_exhaustion_without_reclaim() {
        let (_dir, mut catalog) = fresh_catalog(1);
        let segment_id = catalog.create_segment("s", "").unwrap();

        catalog
            .bind_new_block(false, segment_id, 0, 1, Uuid::new_v4())
            .unwrap();
        let err = catalog
            .bind_new_block(false, segment_id, 1, 2, Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, StoreError::NoFreeBlocks));
    }

    #[test]
    fn test_auto_reclaim_evicts_oldest() {
        let (_dir, mut catalog) = fresh_catalog(2);
        let segment_id = catalog.create_segment("s", "").unwrap();

        let first = catalog
            .bind_new_block(false, segment_id, 0, 10, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(first.id, 19).unwrap();
        let second = catalog
            .bind_new_block(false, segment_id, 1, 20, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(second.id, 29).unwrap();

        // Container is full; reclaim must evict the oldest end timestamp.
        let reclaimed = catalog
            .bind_new_block(true, segment_id, 2, 30, Uuid::new_v4())
            .unwrap();
        assert_eq!(reclaimed.block_id, first.block_id);

        let remaining = catalog.blocks_in_range("s", 0, i64::MAX).unwrap();
        let sequences: Vec<i64> = remaining.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_trigger_drops_empty_segments() {
        let (_dir, mut catalog) = fresh_catalog(1);
        let segment_id = catalog.create_segment("gone", "").unwrap();
        let bound = catalog
            .bind_new_block(false, segment_id, 0, 5, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(bound.id, 9).unwrap();

        catalog.free_blocks("gone", 0, 100).unwrap();

        let segments: i64 = catalog
            .conn
            .query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))
            .unwrap();
        assert_eq!(segments, 0);
    }

    #[test]
    fn test_free_blocks_skips_partial_overlap() {
        let (_dir, mut catalog) = fresh_catalog(3);
        let segment_id = catalog.create_segment("s", "").unwrap();

        for (sequence, start, end) in [(0i64, 0, 99), (1, 100, 199), (2, 200, 299)] {
            let bound = catalog
                .bind_new_block(false, segment_id, sequence, start, Uuid::new_v4())
                .unwrap();
            catalog.finalize_segment_block(bound.id, end).unwrap();
        }

        // [50, 250] wholly contains only the middle block.
        let freed = catalog.free_blocks("s", 50, 250).unwrap();
        assert_eq!(freed, 1);

        let remaining = catalog.blocks_in_range("s", 0, 1000).unwrap();
        let starts: Vec<i64> = remaining.iter().map(|b| b.start_timestamp).collect();
        assert_eq!(starts, vec![0, 200]);
    }

    #[test]
    fn test_next_and_prev_cross_segments() {
        let (_dir, mut catalog) = fresh_catalog(4);
        let seg_a = catalog.create_segment("s", "a").unwrap();
        let a0 = catalog
            .bind_new_block(false, seg_a, 0, 0, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(a0.id, 9).unwrap();
        let a1 = catalog
            .bind_new_block(false, seg_a, 1, 10, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(a1.id, 19).unwrap();

        let seg_b = catalog.create_segment("s", "b").unwrap();
        let b0 = catalog
            .bind_new_block(false, seg_b, 0, 20, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(b0.id, 29).unwrap();

        let next = catalog.next_block("s", seg_a, 0).unwrap().unwrap();
        assert_eq!((next.segment_id, next.sequence), (seg_a, 1));

        // Crossing the segment boundary forward and back.
        let next = catalog.next_block("s", seg_a, 1).unwrap().unwrap();
        assert_eq!((next.segment_id, next.sequence), (seg_b, 0));
        let prev = catalog.prev_block("s", seg_b, 0).unwrap().unwrap();
        assert_eq!((prev.segment_id, prev.sequence), (seg_a, 1));

        assert!(catalog.prev_block("s", seg_a, 0).unwrap().is_none());
        assert!(catalog.next_block("s", seg_b, 0).unwrap().is_none());
    }

    #[test]
    fn test_block_for_timestamp_fallback() {
        let (_dir, mut catalog) = fresh_catalog(2);
        let segment_id = catalog.create_segment("s", "").unwrap();
        let bound = catalog
            .bind_new_block(false, segment_id, 0, 100, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(bound.id, 199).unwrap();

        // Contained.
        let hit = catalog.block_for_timestamp("s", 150).unwrap().unwrap();
        assert_eq!(hit.sequence, 0);
        // Before the stream starts: fall forward to the first block.
        let hit = catalog.block_for_timestamp("s", 5).unwrap().unwrap();
        assert_eq!(hit.start_timestamp, 100);
        // After everything: nothing.
        assert!(catalog.block_for_timestamp("s", 500).unwrap().is_none());
    }

    #[test]
    fn test_contiguous_regions_split_on_gap() {
        let (_dir, mut catalog) = fresh_catalog(4);
        let segment_id = catalog.create_segment("s", "").unwrap();

        for (sequence, (start, end)) in [(0i64, (0, 9)), (1, (10, 19)), (3, (30, 39))] {
            // Sequence 2 is missing, as if freed.
            catalog
                .conn
                .execute(
                    "INSERT INTO segment_blocks \
                     (segment_id, sequence, block_id, block_idx, start_timestamp, \
                      end_timestamp, uuid) \
                     VALUES (?1, ?2, 1, 0, ?3, ?4, ?5)",
                    params![segment_id, sequence, start, end, Uuid::new_v4().to_string()],
                )
                .unwrap();
        }

        let regions = catalog.contiguous_regions("s", 0, 100).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(
            (regions[0].start_timestamp, regions[0].end_timestamp),
            (0, 19)
        );
        assert_eq!(
            (regions[1].start_timestamp, regions[1].end_timestamp),
            (30, 39)
        );
    }

    #[test]
    fn test_stream_tags_in_range() {
        let (_dir, mut catalog) = fresh_catalog(2);
        let seg_a = catalog.create_segment("alpha", "").unwrap();
        let a = catalog
            .bind_new_block(false, seg_a, 0, 0, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(a.id, 50).unwrap();

        let seg_b = catalog.create_segment("beta", "").unwrap();
        let b = catalog
            .bind_new_block(false, seg_b, 0, 100, Uuid::new_v4())
            .unwrap();
        catalog.finalize_segment_block(b.id, 150).unwrap();

        let tags = catalog.stream_tags_in_range(0, 60).unwrap();
        assert_eq!(tags, vec!["alpha".to_string()]);
        let mut tags = catalog.stream_tags_in_range(0, 200).unwrap();
        tags.sort();
        assert_eq!(tags, vec!["alpha".to_string(), "beta".to_string()]);
    }
}
