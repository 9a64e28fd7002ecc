// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client read handle.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::watch;

use super::StreamSession;
use crate::cursor::CursorState;
use crate::error::RelayError;
use crate::events::RelayEvent;
use crate::ClientId;

/// Result of one read attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Contiguous bytes in write order.
    Data(Bytes),
    /// The writer lapped this client; `skipped` bytes were lost before `data`.
    Overwritten { data: Bytes, skipped: u64 },
    /// Nothing unread yet.
    WouldBlock,
    /// The session stopped or the client was detached.
    Closed,
}

/// A client's handle on a session. Dropping it detaches the client.
pub struct ClientReader {
    session: Arc<StreamSession>,
    client_id: ClientId,
    signal: watch::Receiver<u64>,
    detached: bool,
}

impl ClientReader {
    pub(super) fn new(session: Arc<StreamSession>, client_id: ClientId) -> Self {
        let signal = session.ring.subscribe();
        Self { session, client_id, signal, detached: false }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn session(&self) -> &Arc<StreamSession> {
        &self.session
    }

    /// Read whatever is available without waiting.
    ///
    /// After the sources run out the reader still drains what the ring holds
    /// and only then reports [`ReadOutcome::Closed`].
    pub fn try_read(&mut self) -> Result<ReadOutcome, RelayError> {
        if self.detached {
            return Ok(ReadOutcome::Closed);
        }
        let stopped = self.session.is_stopped();
        if stopped && !self.session.is_exhausted() {
            return Ok(ReadOutcome::Closed);
        }
        // Mark the signal seen before looking at the ring so a write that
        // lands after this read still wakes `next`.
        self.signal.borrow_and_update();

        match self.read_once() {
            Err(RelayError::UnknownClient(_)) => {
                self.detached = true;
                Ok(ReadOutcome::Closed)
            }
            Ok(ReadOutcome::WouldBlock) if stopped => Ok(ReadOutcome::Closed),
            other => other,
        }
    }

    fn read_once(&self) -> Result<ReadOutcome, RelayError> {
        let session = &self.session;
        let (state, data) = {
            let ring = session.ring.read();
            let state = session.cursors.classify_and_reconcile(&self.client_id, &ring)?;
            let offset = session
                .cursors
                .position(&self.client_id)
                .ok_or(RelayError::UnknownClient(self.client_id))?;
            (state, ring.read_from(offset, session.config.read_chunk_size)?)
        };

        if !data.is_empty() {
            session.cursors.advance(&self.client_id, data.len())?;
            session.stats.add_bytes_read(&self.client_id, data.len() as u64);
        }

        match state {
            CursorState::CaughtUp if data.is_empty() => Ok(ReadOutcome::WouldBlock),
            CursorState::CaughtUp => Ok(ReadOutcome::Data(data)),
            CursorState::Overwritten { skipped } => {
                tracing::debug!(
                    session = %session.id,
                    client = %self.client_id,
                    skipped,
                    "client lapped by writer"
                );
                session.emit(RelayEvent::ClientOverwritten {
                    session: session.id,
                    client: self.client_id,
                    skipped,
                });
                Ok(ReadOutcome::Overwritten { data, skipped })
            }
        }
    }

    /// Wait for the next chunk. Never returns [`ReadOutcome::WouldBlock`].
    pub async fn next(&mut self) -> Result<ReadOutcome, RelayError> {
        let mut waiting_since: Option<Instant> = None;
        loop {
            match self.try_read()? {
                ReadOutcome::WouldBlock => {
                    waiting_since.get_or_insert_with(Instant::now);
                }
                outcome => {
                    if let Some(since) = waiting_since {
                        self.session.stats.record_read_wait(&self.client_id, since.elapsed());
                    }
                    return Ok(outcome);
                }
            }
            tokio::select! {
                // try_read decides between draining and closing.
                _ = self.session.cancel.cancelled() => {}
                changed = self.signal.changed() => {
                    if changed.is_err() {
                        return Ok(ReadOutcome::Closed);
                    }
                }
            }
        }
    }

    /// Detach now instead of on drop.
    pub fn detach(mut self) {
        self.detach_inner();
    }

    fn detach_inner(&mut self) {
        if !self.detached {
            self.detached = true;
            self.session.detach_client(&self.client_id);
        }
    }
}

impl Drop for ClientReader {
    fn drop(&mut self) {
        self.detach_inner();
    }
}
