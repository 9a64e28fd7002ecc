// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client read positions inside a session's ring buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::RelayError;
use crate::ring::RingBuffer;
use crate::session::ClientMeta;
use crate::stats::StatisticsManager;
use crate::ClientId;

/// Fraction of capacity a late joiner starts past the oldest retained byte.
const JOIN_LOOKAHEAD_DIVISOR: usize = 10;

/// One client's position in the ring.
#[derive(Debug, Clone)]
pub struct ClientCursor {
    pub client_id: ClientId,
    /// Logical offset of the next byte to deliver.
    pub offset: u64,
    pub registered_at: Instant,
    pub last_read_at: Option<Instant>,
    /// Bytes skipped because the writer lapped this client.
    pub dropped_bytes: u64,
}

/// Result of checking a cursor against the write position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    CaughtUp,
    /// The writer lapped the cursor; `skipped` unread bytes were lost.
    Overwritten { skipped: u64 },
}

/// Registry of client cursors for one ring buffer.
pub struct ClientCursorRegistry {
    cursors: Mutex<HashMap<ClientId, ClientCursor>>,
    stats: Arc<StatisticsManager>,
    pending_drops: AtomicU64,
    total_drops: AtomicU64,
}

impl ClientCursorRegistry {
    pub fn new(stats: Arc<StatisticsManager>) -> Self {
        Self {
            cursors: Mutex::new(HashMap::new()),
            stats,
            pending_drops: AtomicU64::new(0),
            total_drops: AtomicU64::new(0),
        }
    }

    /// Place a new cursor and start its statistics. Returns the physical start index.
    ///
    /// Before the ring first wraps a client starts at the beginning of the
    /// data. Afterwards it starts a tenth of the capacity past the oldest
    /// retained byte so its first read does not already find it lapped.
    pub fn register(&self, client: &ClientMeta, ring: &RingBuffer) -> Result<usize, RelayError> {
        let offset = if ring.has_wrapped() {
            let lookahead = (ring.capacity() / JOIN_LOOKAHEAD_DIVISOR) as u64;
            (ring.oldest_offset() + lookahead).min(ring.total_written())
        } else {
            ring.oldest_offset()
        };

        let mut cursors = self.cursors.lock();
        if cursors.contains_key(&client.client_id) {
            return Err(RelayError::DuplicateClient(client.client_id));
        }
        cursors.insert(
            client.client_id,
            ClientCursor {
                client_id: client.client_id,
                offset,
                registered_at: Instant::now(),
                last_read_at: None,
                dropped_bytes: 0,
            },
        );
        drop(cursors);

        self.stats.register_client(client);
        let index = ring.index_of(offset);
        tracing::info!(client = %client.client_id, read_index = index, "registered client");
        Ok(index)
    }

    /// Remove a cursor and its statistics. Returns whether anything was removed.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        let removed = self.cursors.lock().remove(client_id).is_some();
        self.stats.unregister_client(client_id);
        if removed {
            tracing::info!(client = %client_id, "unregistered client");
        }
        removed
    }

    /// Move a cursor forward after a successful read.
    pub fn advance(&self, client_id: &ClientId, bytes: usize) -> Result<(), RelayError> {
        let mut cursors = self.cursors.lock();
        let cursor =
            cursors.get_mut(client_id).ok_or(RelayError::UnknownClient(*client_id))?;
        cursor.offset += bytes as u64;
        cursor.last_read_at = Some(Instant::now());
        Ok(())
    }

    /// Snap a lapped cursor forward before its next read.
    ///
    /// A lapped cursor moves to just past the oldest retained byte, leaving
    /// `capacity - 1` unread bytes when the ring is full. The lost bytes are
    /// counted as a drop event; the producer is never held back.
    pub fn classify_and_reconcile(
        &self,
        client_id: &ClientId,
        ring: &RingBuffer,
    ) -> Result<CursorState, RelayError> {
        let mut cursors = self.cursors.lock();
        let cursor =
            cursors.get_mut(client_id).ok_or(RelayError::UnknownClient(*client_id))?;

        let oldest = ring.oldest_offset();
        if cursor.offset >= oldest {
            return Ok(CursorState::CaughtUp);
        }

        let resync = (oldest + 1).min(ring.total_written());
        let skipped = resync - cursor.offset;
        cursor.offset = resync;
        cursor.dropped_bytes += skipped;
        drop(cursors);

        self.pending_drops.fetch_add(1, Ordering::Relaxed);
        self.total_drops.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client = %client_id, skipped, "client overwritten, cursor resynced");
        Ok(CursorState::Overwritten { skipped })
    }

    pub fn position(&self, client_id: &ClientId) -> Option<u64> {
        self.cursors.lock().get(client_id).map(|c| c.offset)
    }

    /// Physical read index of a client's cursor.
    pub fn read_index(&self, client_id: &ClientId, ring: &RingBuffer) -> Option<usize> {
        self.position(client_id).map(|offset| ring.index_of(offset))
    }

    pub fn get(&self, client_id: &ClientId) -> Option<ClientCursor> {
        self.cursors.lock().get(client_id).cloned()
    }

    /// Smallest physical read index across all clients.
    pub fn oldest_index(&self, ring: &RingBuffer) -> Option<usize> {
        self.cursors.lock().values().map(|c| ring.index_of(c.offset)).min()
    }

    /// Clients whose unread backlog exceeds `ratio` of the capacity.
    pub fn lagging(&self, ring: &RingBuffer, ratio: f64) -> Vec<(ClientId, u64)> {
        let limit = (ring.capacity() as f64 * ratio) as u64;
        self.cursors
            .lock()
            .values()
            .filter_map(|c| {
                let distance = ring.distance(c.offset);
                (distance > limit).then_some((c.client_id, distance))
            })
            .collect()
    }

    /// Drop events since the previous call.
    pub fn take_drop_events(&self) -> u64 {
        self.pending_drops.swap(0, Ordering::Relaxed)
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops.load(Ordering::Relaxed)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.cursors.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every cursor and its statistics.
    pub fn clear(&self) {
        let ids: Vec<ClientId> = self.cursors.lock().drain().map(|(id, _)| id).collect();
        for id in ids {
            self.stats.unregister_client(&id);
        }
    }
}

#[cfg(test)]
#[path = "cursor_tests.rs"]
mod tests;
