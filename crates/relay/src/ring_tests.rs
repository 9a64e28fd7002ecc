// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::*;

fn pattern(start: usize, len: usize) -> Vec<u8> {
    (start..start + len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn empty_read() -> anyhow::Result<()> {
    let ring = RingBuffer::new(16, 64);
    assert_eq!(ring.read_from(0, 8)?, Bytes::new());
    assert_eq!(ring.write_index(), 0);
    assert!(!ring.has_wrapped());
    Ok(())
}

#[test]
fn sequential_writes() -> anyhow::Result<()> {
    let mut ring = RingBuffer::new(16, 64);
    assert_eq!(ring.write(b"hello"), 5);
    ring.write(b" world");

    assert_eq!(ring.read_from(0, 64)?, &b"hello world"[..]);
    assert_eq!(ring.read_from(5, 64)?, &b" world"[..]);
    assert_eq!(ring.read_from(0, 4)?, &b"hell"[..]);
    assert_eq!(ring.total_written(), 11);
    assert_eq!(ring.write_index(), 11);
    Ok(())
}

#[test]
fn wrap_around_sets_flag_and_index() -> anyhow::Result<()> {
    let mut ring = RingBuffer::new(1000, 4000);
    ring.write(&pattern(0, 1500));

    assert!(ring.has_wrapped());
    assert_eq!(ring.write_index(), 500);
    assert_eq!(ring.oldest_offset(), 500);
    assert_eq!(ring.read_from(500, 1000)?, pattern(500, 1000));
    Ok(())
}

#[test]
fn exact_capacity_write_wraps_to_zero() {
    let mut ring = RingBuffer::new(4, 16);
    ring.write(b"abcd");
    assert_eq!(ring.write_index(), 0);
    assert!(ring.has_wrapped());
}

#[test]
fn read_slice_stitches_wrapped_range() -> anyhow::Result<()> {
    let mut ring = RingBuffer::new(8, 8);
    ring.write(b"abcdef");
    ring.write(b"ghij"); // storage: "ijcdefgh", write_index = 2

    assert_eq!(ring.read_slice(6, 4)?, &b"ghij"[..]);
    assert_eq!(ring.read_slice(2, 4)?, &b"cdef"[..]);
    Ok(())
}

#[yare::parameterized(
    too_long = { 0, 9 },
    index_past_end = { 8, 1 },
)]
fn read_slice_out_of_range(index: usize, length: usize) {
    let ring = RingBuffer::new(8, 8);
    assert!(matches!(ring.read_slice(index, length), Err(RelayError::OutOfRange { .. })));
}

#[test]
fn read_from_overwritten_offset_is_out_of_range() {
    let mut ring = RingBuffer::new(4, 4);
    ring.write(b"abcdefgh");
    assert!(ring.read_from(0, 4).is_err());
    assert!(ring.read_from(9, 4).is_err());
}

#[test]
fn oversized_write_keeps_tail() -> anyhow::Result<()> {
    let mut ring = RingBuffer::new(4, 4);
    assert_eq!(ring.write(b"0123456789"), 10);
    assert_eq!(ring.read_from(6, 4)?, &b"6789"[..]);
    assert_eq!(ring.retained(), 4);
    Ok(())
}

#[test]
fn distance_helpers() {
    let mut ring = RingBuffer::new(10, 10);
    ring.write(&pattern(0, 13));
    assert_eq!(ring.write_index(), 3);
    assert_eq!(ring.distance(5), 8);
    assert_eq!(ring.index_distance(5), 8);
    assert_eq!(ring.index_distance(3), 0);
}

#[test]
fn resize_preserves_logical_bytes() -> anyhow::Result<()> {
    let mut ring = RingBuffer::new(1000, 4000);
    ring.write(&pattern(0, 1500));
    let before = ring.read_from(600, 900)?;

    assert!(ring.resize(1200));
    assert_eq!(ring.capacity(), 1200);
    assert_eq!(ring.write_index(), 300);
    assert_eq!(ring.read_from(600, 900)?, before);

    // Growth leaves room: the next 200 bytes overwrite nothing still retained.
    ring.write(&pattern(1500, 200));
    assert_eq!(ring.oldest_offset(), 500);
    assert_eq!(ring.read_from(500, 1200)?, pattern(500, 1200));
    Ok(())
}

#[test]
fn resize_is_noop_unless_strictly_larger() {
    let mut ring = RingBuffer::new(100, 400);
    assert!(!ring.resize(100));
    assert!(!ring.resize(50));
    assert_eq!(ring.capacity(), 100);
}

#[test]
fn growth_is_bounded() {
    let mut ring = RingBuffer::with_growth_limit(1000, 4);
    assert_eq!(ring.grow(), Some((1000, 1200)));
    for _ in 0..32 {
        ring.grow();
    }
    assert_eq!(ring.capacity(), 4000);
    assert_eq!(ring.grow(), None);
    assert!(!ring.resize(10_000));
    assert_eq!(ring.original_capacity(), 1000);
}

#[tokio::test]
async fn shared_write_signals_readers() -> anyhow::Result<()> {
    let shared = SharedRing::new(RingBuffer::new(64, 64));
    let mut rx = shared.subscribe();

    shared.write(b"abc");
    rx.changed().await?;
    assert_eq!(*rx.borrow_and_update(), 3);
    assert_eq!(shared.read().read_from(0, 64)?, &b"abc"[..]);
    Ok(())
}

proptest! {
    #[test]
    fn reader_keeping_pace_sees_every_byte(
        writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..40),
        capacity in 1usize..256,
    ) {
        let mut ring = RingBuffer::new(capacity, capacity * 4);
        let mut expected = Vec::new();
        let mut seen = Vec::new();
        let mut offset = 0u64;

        for write in &writes {
            // Writes longer than the capacity are delivered in capacity-sized pieces.
            for piece in write.chunks(capacity) {
                ring.write(piece);
                expected.extend_from_slice(piece);
                let data = ring.read_from(offset, usize::MAX).map_err(|e| TestCaseError::fail(e.to_string()))?;
                offset += data.len() as u64;
                seen.extend_from_slice(&data);
            }
        }

        prop_assert_eq!(seen, expected);
    }

    #[test]
    fn resize_keeps_unread_window(
        initial in 16usize..512,
        written in 0usize..2048,
        grow_to in 0usize..4096,
    ) {
        let mut ring = RingBuffer::with_growth_limit(initial, 4);
        ring.write(&pattern(0, written));
        let oldest = ring.oldest_offset();
        let before = ring.read_from(oldest, usize::MAX).map_err(|e| TestCaseError::fail(e.to_string()))?;

        ring.resize(grow_to);

        prop_assert!(ring.capacity() <= initial * 4);
        let after = ring.read_from(oldest, usize::MAX).map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(before, after);
    }
}
