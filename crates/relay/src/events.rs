// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle notifications fanned out to subscribers of a relay.

use serde::{Deserialize, Serialize};

use crate::{ClientId, SessionId};

/// Capacity of the lifecycle broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by sessions, tagged with the session they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A session was created for a channel.
    SessionStarted { session: SessionId, url: String },
    /// A producer started pulling from `url`.
    SourceStarted { session: SessionId, url: String },
    /// The producer for `url` failed; failover follows.
    UpstreamFailed { session: SessionId, url: String, reason: String },
    /// No candidate source is left.
    SourcesExhausted { session: SessionId },
    ClientAttached { session: SessionId, client: ClientId, read_index: usize },
    ClientDetached { session: SessionId, client: ClientId },
    /// The writer lapped a client and its cursor was snapped forward.
    ClientOverwritten { session: SessionId, client: ClientId, skipped: u64 },
    BufferResized { session: SessionId, old_capacity: usize, new_capacity: usize },
    SessionStopped { session: SessionId },
}

impl RelayEvent {
    /// Return the session this event belongs to.
    pub fn session(&self) -> SessionId {
        match self {
            Self::SessionStarted { session, .. }
            | Self::SourceStarted { session, .. }
            | Self::UpstreamFailed { session, .. }
            | Self::SourcesExhausted { session }
            | Self::ClientAttached { session, .. }
            | Self::ClientDetached { session, .. }
            | Self::ClientOverwritten { session, .. }
            | Self::BufferResized { session, .. }
            | Self::SessionStopped { session } => *session,
        }
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
