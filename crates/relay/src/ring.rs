// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Growable circular byte buffer shared by one producer and many readers.

use bytes::{Bytes, BytesMut};
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::watch;

use crate::error::RelayError;

/// Circular byte storage with a single write cursor.
///
/// Positions come in two flavours: a logical offset (bytes ever written
/// before that position, monotonic) and a physical index into storage
/// (`offset mod capacity`). Readers hold logical offsets so that a resize,
/// which changes the physical layout, never changes what they read next.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    write_index: usize,
    original_capacity: usize,
    max_capacity: usize,
    has_wrapped: bool,
    total_written: u64,
    retained: usize,
}

impl RingBuffer {
    /// Create a buffer of `capacity` bytes that may grow up to `max_capacity`.
    pub fn new(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: vec![0u8; capacity],
            write_index: 0,
            original_capacity: capacity,
            max_capacity: max_capacity.max(capacity),
            has_wrapped: false,
            total_written: 0,
            retained: 0,
        }
    }

    /// Create a buffer whose growth is capped at `factor` times its initial size.
    pub fn with_growth_limit(capacity: usize, factor: usize) -> Self {
        Self::new(capacity, capacity.saturating_mul(factor))
    }

    /// Append data, overwriting the oldest bytes once storage is full.
    ///
    /// Never blocks and always accepts the full slice; data longer than the
    /// capacity leaves only its tail in storage.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let capacity = self.capacity();
        for chunk in data.chunks(capacity) {
            let start = self.write_index;
            let end = start + chunk.len();

            if end <= capacity {
                self.buf[start..end].copy_from_slice(chunk);
            } else {
                let first = capacity - start;
                self.buf[start..capacity].copy_from_slice(&chunk[..first]);
                self.buf[..chunk.len() - first].copy_from_slice(&chunk[first..]);
            }

            if end >= capacity {
                self.has_wrapped = true;
            }
            self.write_index = end % capacity;
            self.total_written += chunk.len() as u64;
            self.retained = (self.retained + chunk.len()).min(capacity);
        }
        data.len()
    }

    /// Copy `length` bytes starting at physical `from_index`.
    ///
    /// A range crossing the end of storage is stitched into one contiguous
    /// copy of the tail and head segments.
    pub fn read_slice(&self, from_index: usize, length: usize) -> Result<Bytes, RelayError> {
        let capacity = self.capacity();
        if length > capacity || from_index >= capacity {
            return Err(RelayError::OutOfRange { index: from_index, length, capacity });
        }

        if from_index + length <= capacity {
            return Ok(Bytes::copy_from_slice(&self.buf[from_index..from_index + length]));
        }

        let first = capacity - from_index;
        let mut out = BytesMut::with_capacity(length);
        out.extend_from_slice(&self.buf[from_index..capacity]);
        out.extend_from_slice(&self.buf[..length - first]);
        Ok(out.freeze())
    }

    /// Copy up to `max_len` unread bytes starting at logical `offset`.
    ///
    /// Returns an empty buffer when `offset` is the write position.
    pub fn read_from(&self, offset: u64, max_len: usize) -> Result<Bytes, RelayError> {
        if offset < self.oldest_offset() || offset > self.total_written {
            return Err(RelayError::OutOfRange {
                index: self.index_of(offset),
                length: max_len,
                capacity: self.capacity(),
            });
        }

        let available = (self.total_written - offset) as usize;
        let length = available.min(max_len);
        if length == 0 {
            return Ok(Bytes::new());
        }
        self.read_slice(self.index_of(offset), length)
    }

    /// Grow storage to `new_capacity` (capped at the growth limit).
    ///
    /// Returns `false` without touching anything unless capacity strictly
    /// increases. Retained bytes keep their logical offsets.
    pub fn resize(&mut self, new_capacity: usize) -> bool {
        let capacity = self.capacity();
        let target = new_capacity.min(self.max_capacity);
        if target <= capacity {
            return false;
        }

        let oldest = self.oldest_offset();
        let mut retained = Vec::with_capacity(self.retained);
        if self.retained > 0 {
            let start = self.index_of(oldest);
            let first = (capacity - start).min(self.retained);
            retained.extend_from_slice(&self.buf[start..start + first]);
            retained.extend_from_slice(&self.buf[..self.retained - first]);
        }

        let mut buf = vec![0u8; target];
        let dst = (oldest % target as u64) as usize;
        let first = (target - dst).min(retained.len());
        buf[dst..dst + first].copy_from_slice(&retained[..first]);
        buf[..retained.len() - first].copy_from_slice(&retained[first..]);

        self.buf = buf;
        self.write_index = (self.total_written % target as u64) as usize;
        true
    }

    /// Grow by 20% (bounded by the growth limit).
    ///
    /// Returns `(old, new)` capacities when the buffer actually grew.
    pub fn grow(&mut self) -> Option<(usize, usize)> {
        let capacity = self.capacity();
        let target = capacity.saturating_add(capacity / 5);
        if self.resize(target) {
            Some((capacity, self.capacity()))
        } else {
            None
        }
    }

    /// Physical index of a logical offset.
    pub fn index_of(&self, offset: u64) -> usize {
        (offset % self.capacity() as u64) as usize
    }

    /// Unread bytes between a logical offset and the write position.
    pub fn distance(&self, offset: u64) -> u64 {
        self.total_written.saturating_sub(offset)
    }

    /// `(write_index - index) mod capacity`.
    pub fn index_distance(&self, index: usize) -> usize {
        let capacity = self.capacity();
        (self.write_index + capacity - index % capacity) % capacity
    }

    /// Logical offset of the oldest byte still held.
    pub fn oldest_offset(&self) -> u64 {
        self.total_written - self.retained as u64
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn original_capacity(&self) -> usize {
        self.original_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Whether the write cursor has reached the end of storage at least once.
    pub fn has_wrapped(&self) -> bool {
        self.has_wrapped
    }

    /// Total bytes ever written through this buffer.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Bytes of valid data currently held.
    pub fn retained(&self) -> usize {
        self.retained
    }
}

/// A [`RingBuffer`] shared between a producer, readers and the resize path.
///
/// Write and resize take the exclusive side of one lock. Every write
/// publishes the new `total_written` so blocked readers wake up.
pub struct SharedRing {
    ring: RwLock<RingBuffer>,
    written_tx: watch::Sender<u64>,
}

impl SharedRing {
    pub fn new(ring: RingBuffer) -> Self {
        let (written_tx, _) = watch::channel(ring.total_written());
        Self { ring: RwLock::new(ring), written_tx }
    }

    /// Write under the exclusive lock and signal readers.
    pub fn write(&self, data: &[u8]) -> usize {
        let (written, total) = {
            let mut ring = self.ring.write();
            let written = ring.write(data);
            (written, ring.total_written())
        };
        self.written_tx.send_replace(total);
        written
    }

    /// Shared access for reads and cursor classification.
    pub fn read(&self) -> RwLockReadGuard<'_, RingBuffer> {
        self.ring.read()
    }

    pub fn resize(&self, new_capacity: usize) -> bool {
        self.ring.write().resize(new_capacity)
    }

    pub fn grow(&self) -> Option<(usize, usize)> {
        self.ring.write().grow()
    }

    /// Subscribe to the "new data" signal.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.written_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
