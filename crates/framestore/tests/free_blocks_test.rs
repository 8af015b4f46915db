//! Freeing whole blocks out of the middle of a stream and observing the
//! resulting gap through iteration and contiguous-region queries.

use framestore::layout::{padded_frame_size, BLOCK_HEADER_SIZE, INDEX_ENTRY_SIZE};
use framestore::{allocate, FrameIterator, Reader, Writer};
use tempfile::TempDir;

#[test]
fn test_free_range_leaves_contiguous_gap() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.nts");
    allocate(&path, 4096, 32).unwrap();

    let writer = Writer::open(&path, false).unwrap();
    let per_block = {
        let per_frame = padded_frame_size(1024) + INDEX_ENTRY_SIZE as u64;
        ((writer.block_size() - BLOCK_HEADER_SIZE) as u64 / per_frame) as i64
    };

    let payload = vec![0x7fu8; 1024];
    {
        let mut ctx = writer.create_write_context("s", "").unwrap();
        for ts in 1..=1023i64 {
            writer.write(&mut ctx, &payload, ts, 0).unwrap();
        }
    }

    // Free the whole blocks inside [250, 500]. Block k spans
    // [k*per_block + 1, (k+1)*per_block]; only fully contained spans go.
    writer.free_blocks("s", 250, 500).unwrap();

    let first_freed_block = (250 + per_block - 1) / per_block * per_block + 1;
    let last_freed_block = (500 / per_block) * per_block;

    let mut it = FrameIterator::open(&path, "s").unwrap();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push(it.current().unwrap().timestamp);
        it.next().unwrap();
    }

    // Data on both sides of the gap is intact, the freed middle is gone.
    let expected: Vec<i64> = (1..first_freed_block)
        .chain(last_freed_block + 1..=1023)
        .collect();
    assert_eq!(seen, expected);

    // The catalog sees exactly two contiguous regions.
    let reader = Reader::open(&path).unwrap();
    let regions = reader.query_contiguous_segments("s", 1, 1024).unwrap();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].start_timestamp, 1);
    assert_eq!(regions[0].end_timestamp, first_freed_block - 1);
    assert_eq!(regions[1].start_timestamp, last_freed_block + 1);
    assert_eq!(regions[1].end_timestamp, 1023);
}

#[test]
fn test_freed_blocks_are_reusable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.nts");
    allocate(&path, 65536, 2).unwrap();

    let writer = Writer::open(&path, false).unwrap();
    let payload = vec![0u8; 32 * 1024];

    // Fill both blocks.
    {
        let mut ctx = writer.create_write_context("a", "").unwrap();
        writer.write(&mut ctx, &payload, 1, 0).unwrap();
        writer.write(&mut ctx, &payload, 2, 0).unwrap();
    }

    // Without freeing, a new stream finds no room.
    {
        let mut ctx = writer.create_write_context("b", "").unwrap();
        assert!(writer.write(&mut ctx, &payload, 10, 0).is_err());
    }

    writer.free_blocks("a", 0, 2).unwrap();

    let mut ctx = writer.create_write_context("c", "").unwrap();
    writer.write(&mut ctx, &payload, 10, 0).unwrap();
    drop(ctx);

    let reader = Reader::open(&path).unwrap();
    let tags = reader.query_stream_tags(0, 100).unwrap();
    assert_eq!(tags, vec!["c".to_string()]);
}

#[test]
fn test_open_block_is_never_freed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.nts");
    allocate(&path, 65536, 4).unwrap();

    let writer = Writer::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("live", "").unwrap();
    writer.write(&mut ctx, b"x", 5, 0).unwrap();

    // The context is still open; its block has the end sentinel and must
    // survive any free range.
    writer.free_blocks("live", 0, i64::MAX).unwrap();

    let reader = Reader::open(&path).unwrap();
    let mut count = 0;
    reader.read("live", 0, 100, |_| count += 1).unwrap();
    assert_eq!(count, 1);
    drop(ctx);
}
