//! Container file layout and allocator.
//!
//! A framestore container is a single pre-allocated file holding a fixed
//! number of equally sized blocks behind a 64 KiB header:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (65536 bytes)                                   │
//! │  - Block Size: u32 LE (4 bytes)                              │
//! │  - Block Count: u32 LE (4 bytes)                             │
//! │  - Reserved: zeros                                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Block 0 (block_size bytes)                                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ...                                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Block n_blocks-1                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Block sizes are rounded up to the 64 KiB mapping granularity so every
//! block starts and ends on a mapping boundary on all supported platforms.
//! The relational catalog lives in a sidecar database next to the container
//! (container path with a `.nts` suffix stripped and `.db` appended).

use crate::catalog::Catalog;
use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the container file header.
pub const FILE_HEADER_SIZE: u64 = 65536;

/// Mapping granularity; block sizes are rounded up to a multiple of this.
pub const BLOCK_SIZE_BOUNDARY: u32 = 65536;

/// Size of the per-block header (start timestamp, committed count, reserved).
pub const BLOCK_HEADER_SIZE: u32 = 16;

/// Size of one index entry (i64 timestamp, u64 frame offset).
pub const INDEX_ENTRY_SIZE: u32 = 16;

/// Size of a frame header (16-byte uuid, u32 payload size, u8 flags).
pub const FRAME_HEADER_SIZE: u32 = 21;

/// Smallest block size accepted when opening a container.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Largest block size accepted when opening a container (1 GiB).
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024 * 1024;

/// Container file extension the catalog sidecar name is derived from.
const CONTAINER_EXTENSION: &str = ".nts";

/// Frame timestamps in nanoseconds (or any caller-defined monotonic unit).
pub type Timestamp = i64;

/// Rounds a requested block size up to the mapping granularity.
///
/// A request of zero yields one full boundary.
pub fn round_to_block_boundary(requested: u32) -> u32 {
    if requested == 0 {
        return BLOCK_SIZE_BOUNDARY;
    }
    requested.div_ceil(BLOCK_SIZE_BOUNDARY) * BLOCK_SIZE_BOUNDARY
}

/// Returns the frame's on-disk footprint: header plus payload, rounded up
/// to 8-byte alignment.
pub fn padded_frame_size(payload_len: usize) -> u64 {
    ((FRAME_HEADER_SIZE as u64 + payload_len as u64) + 7) & !7
}

/// Largest payload a single block of the given size can hold.
///
/// One frame header, one index entry, and the block header must fit
/// alongside the payload.
pub fn max_payload(block_size: u32) -> usize {
    (block_size - (FRAME_HEADER_SIZE + INDEX_ENTRY_SIZE + BLOCK_HEADER_SIZE)) as usize
}

/// Byte offset of a block within the container file.
pub fn block_offset(idx: u32, block_size: u32) -> u64 {
    FILE_HEADER_SIZE + idx as u64 * block_size as u64
}

/// Derives the catalog sidecar path from the container path.
///
/// Strips a trailing `.nts` extension when present and appends `.db`.
pub fn catalog_path(container: &Path) -> PathBuf {
    let s = container.to_string_lossy();
    let stem = s.strip_suffix(CONTAINER_EXTENSION).unwrap_or(&s);
    PathBuf::from(format!("{stem}.db"))
}

/// Decoded container file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Size of every block in the container.
    pub block_size: u32,
    /// Number of blocks in the container.
    pub n_blocks: u32,
}

impl FileHeader {
    /// Encodes the header into its first eight on-disk bytes.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.n_blocks.to_le_bytes());
        buf
    }

    /// Decodes a header from the start of a mapped or read header region.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(StoreError::Unknown(
                "container header shorter than 8 bytes".to_string(),
            ));
        }
        let block_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let n_blocks = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Ok(Self {
            block_size,
            n_blocks,
        })
    }
}

/// An open container file: the handle plus its validated geometry.
///
/// The container owns the file descriptor; block mappings are created from
/// it by the block engine and owned by the operation that maps them.
#[derive(Debug)]
pub struct Container {
    file: File,
    header: FileHeader,
    path: PathBuf,
}

impl Container {
    /// Opens a container and validates its header.
    ///
    /// # Errors
    ///
    /// Returns `CantOpen` when the file cannot be opened and
    /// `InvalidBlockSize` when the header's block size falls outside
    /// `[4096, 1 GiB]`.
    pub fn open(path: impl AsRef<Path>, read_write: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(read_write)
            .open(&path)
            .map_err(|e| StoreError::CantOpen {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let len = file.metadata()?.len();
        if len < FILE_HEADER_SIZE {
            return Err(StoreError::CantOpen {
                path: path.display().to_string(),
                reason: format!("file of {len} bytes is smaller than the container header"),
            });
        }

        // Safety: the mapping is read-only and dropped before return; the
        // header region is never remapped writable by readers.
        let mm = unsafe {
            memmap2::MmapOptions::new()
                .len(FILE_HEADER_SIZE as usize)
                .map(&file)
                .map_err(|e| StoreError::CantOpen {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
        };
        let header = FileHeader::decode(&mm)?;

        if header.block_size < MIN_BLOCK_SIZE || header.block_size > MAX_BLOCK_SIZE {
            return Err(StoreError::InvalidBlockSize(header.block_size));
        }

        Ok(Self { file, header, path })
    }

    /// Returns the underlying file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Returns the container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the size of every block in this container.
    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    /// Returns the number of blocks in this container.
    pub fn n_blocks(&self) -> u32 {
        self.header.n_blocks
    }

    /// Returns the byte offset of the given block.
    pub fn block_offset(&self, idx: u32) -> u64 {
        block_offset(idx, self.header.block_size)
    }
}

/// Creates a new container file and its catalog sidecar.
///
/// The block size is rounded up to the 64 KiB boundary, the file is
/// contiguously preallocated to `header + n_blocks * block_size`, the header
/// is written, and a fresh catalog is installed with one `free` block row
/// per physical block. Any stale sidecar from a previous container at the
/// same path is replaced.
///
/// # Errors
///
/// Returns `UnableToAllocateFile` when preallocation fails and catalog
/// errors when schema installation fails.
pub fn allocate(path: impl AsRef<Path>, block_size: u32, n_blocks: u32) -> Result<()> {
    let path = path.as_ref();
    let block_size = round_to_block_boundary(block_size);
    let file_size = FILE_HEADER_SIZE + n_blocks as u64 * block_size as u64;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| StoreError::CantOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    file.allocate(file_size)
        .map_err(StoreError::UnableToAllocateFile)?;

    let header = FileHeader {
        block_size,
        n_blocks,
    };
    file.write_all(&header.encode())?;
    file.sync_all()?;

    let db_path = catalog_path(path);
    if db_path.exists() {
        std::fs::remove_file(&db_path)?;
    }
    Catalog::create(&db_path, n_blocks)?;

    debug!(
        path = %path.display(),
        block_size,
        n_blocks,
        "allocated container"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_to_block_boundary() {
        assert_eq!(round_to_block_boundary(0), 65536);
        assert_eq!(round_to_block_boundary(1), 65536);
        assert_eq!(round_to_block_boundary(65536), 65536);
        assert_eq!(round_to_block_boundary(65537), 131072);
        assert_eq!(round_to_block_boundary(1024 * 1024), 1024 * 1024);
    }

    #[test]
    fn test_padded_frame_size_alignment() {
        // 21-byte header alone pads to 24.
        assert_eq!(padded_frame_size(0), 24);
        assert_eq!(padded_frame_size(3), 24);
        assert_eq!(padded_frame_size(4), 32);
        assert_eq!(padded_frame_size(11), 32);
        for len in 0..256 {
            assert_eq!(padded_frame_size(len) % 8, 0);
            assert!(padded_frame_size(len) >= FRAME_HEADER_SIZE as u64 + len as u64);
        }
    }

    #[test]
    fn test_catalog_path_derivation() {
        assert_eq!(
            catalog_path(Path::new("/data/video.nts")),
            PathBuf::from("/data/video.db")
        );
        assert_eq!(
            catalog_path(Path::new("/data/video")),
            PathBuf::from("/data/video.db")
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader {
            block_size: 131072,
            n_blocks: 42,
        };
        let encoded = header.encode();
        assert_eq!(FileHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn test_allocate_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.nts");

        allocate(&path, 100_000, 4).unwrap();

        let container = Container::open(&path, false).unwrap();
        // 100_000 rounds up to two boundaries.
        assert_eq!(container.block_size(), 131072);
        assert_eq!(container.n_blocks(), 4);
        assert_eq!(container.block_offset(0), FILE_HEADER_SIZE);
        assert_eq!(container.block_offset(1), FILE_HEADER_SIZE + 131072);

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, FILE_HEADER_SIZE + 4 * 131072);
        assert!(catalog_path(&path).exists());
    }

    #[test]
    fn test_open_rejects_bad_block_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.nts");

        // Hand-craft a header with an undersized block size.
        let mut bytes = vec![0u8; FILE_HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&512u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        match Container::open(&path, false) {
            Err(StoreError::InvalidBlockSize(512)) => {}
            other => panic!("expected InvalidBlockSize, got {other:?}"),
        }
    }
}
