// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use crate::{ClientId, SessionId};

/// Errors raised by the streaming engine.
///
/// Only the shared producer's failure affects every client of a session;
/// everything else is scoped to the caller that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// A cursor already exists for this client.
    DuplicateClient(ClientId),
    /// The session already serves `max_streams` clients.
    CapacityExceeded { max_streams: usize },
    /// A buffer read asked for more than the buffer holds.
    OutOfRange { index: usize, length: usize, capacity: usize },
    /// No cursor is registered for this client.
    UnknownClient(ClientId),
    /// No live session has this handle.
    SessionNotFound(SessionId),
    /// The session was stopped and accepts no further work.
    SessionStopped,
    /// The upstream producer died.
    UpstreamFailure(String),
    /// Killing a spawned upstream process failed.
    ProcessTerminationFailure { pid: u32, reason: String },
    /// Every candidate source has been tried.
    SourcesExhausted,
}

impl RelayError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateClient(_) => "DUPLICATE_CLIENT",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::UnknownClient(_) => "UNKNOWN_CLIENT",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionStopped => "SESSION_STOPPED",
            Self::UpstreamFailure(_) => "UPSTREAM_FAILURE",
            Self::ProcessTerminationFailure { .. } => "PROCESS_TERMINATION_FAILURE",
            Self::SourcesExhausted => "SOURCES_EXHAUSTED",
        }
    }

    /// Whether the error is scoped to a single client rather than the whole session.
    pub fn is_client_scoped(&self) -> bool {
        matches!(
            self,
            Self::DuplicateClient(_)
                | Self::CapacityExceeded { .. }
                | Self::OutOfRange { .. }
                | Self::UnknownClient(_)
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateClient(id) => write!(f, "client {id} is already registered"),
            Self::CapacityExceeded { max_streams } => {
                write!(f, "session is at capacity ({max_streams} clients)")
            }
            Self::OutOfRange { index, length, capacity } => {
                write!(f, "read of {length} bytes at {index} exceeds buffer capacity {capacity}")
            }
            Self::UnknownClient(id) => write!(f, "client {id} is not registered"),
            Self::SessionNotFound(id) => write!(f, "session {id} not found"),
            Self::SessionStopped => f.write_str("session stopped"),
            Self::UpstreamFailure(reason) => write!(f, "upstream failure: {reason}"),
            Self::ProcessTerminationFailure { pid, reason } => {
                write!(f, "failed to terminate process {pid}: {reason}")
            }
            Self::SourcesExhausted => f.write_str("all stream sources exhausted"),
        }
    }
}

impl std::error::Error for RelayError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
