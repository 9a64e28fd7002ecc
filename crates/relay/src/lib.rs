// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod config;
pub mod cursor;
pub mod download;
pub mod error;
pub mod events;
pub mod manager;
pub mod ring;
pub mod run;
pub mod session;
pub mod stats;
pub mod test_support;

/// Identifies one downstream consumer.
pub type ClientId = uuid::Uuid;

/// Identifies one live session.
pub type SessionId = uuid::Uuid;

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
