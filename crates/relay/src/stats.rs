// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client and upstream throughput statistics.
//!
//! One [`StatisticsManager`] and one [`InputStatistics`] belong to each
//! session and are dropped with it, so repeated sessions on the same
//! channel never share counters.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::{ClientMeta, StreamInfo};
use crate::{epoch_ms, ClientId, SessionId};

/// Width of the trailing bitrate window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Byte counter with a trailing-window bitrate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    total: u64,
    window: Duration,
    sample_bytes: u64,
    sample_at: Instant,
    last_rate: Option<u64>,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self { total: 0, window, sample_bytes: 0, sample_at: now, last_rate: None }
    }

    pub fn add(&mut self, bytes: u64) {
        self.add_at(bytes, Instant::now());
    }

    pub fn add_at(&mut self, bytes: u64, now: Instant) {
        self.total += bytes;
        self.sample(now);
    }

    /// Close the current window if it has run its full width.
    pub fn sample(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.sample_at);
        if elapsed >= self.window {
            self.last_rate = Some(bits_per_second(self.total - self.sample_bytes, elapsed));
            self.sample_bytes = self.total;
            self.sample_at = now;
        }
    }

    /// Bitrate of the last closed window, or of the open window when none
    /// has closed yet or the open one has outlived its width.
    pub fn bits_per_second_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.sample_at);
        match self.last_rate {
            Some(rate) if elapsed < self.window => rate,
            _ => bits_per_second(self.total - self.sample_bytes, elapsed),
        }
    }

    pub fn bits_per_second(&self) -> u64 {
        self.bits_per_second_at(Instant::now())
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        ((bytes * 8) as f64 / secs) as u64
    } else {
        0
    }
}

/// Point-in-time copy of one client's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatistics {
    pub client_id: ClientId,
    pub client_agent: String,
    pub client_ip_address: String,
    pub bytes_read: u64,
    pub bits_per_second: u64,
    /// How long the client's most recent read waited for data, in ms.
    pub read_wait_ms: u64,
    /// Registration time in epoch milliseconds.
    pub start_time: u64,
}

struct ClientCounters {
    agent: String,
    ip_address: String,
    start_time: u64,
    meter: RateMeter,
    read_wait: Duration,
}

/// Per-client read counters for one session.
#[derive(Default)]
pub struct StatisticsManager {
    clients: Mutex<HashMap<ClientId, ClientCounters>>,
}

impl StatisticsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for a client. Re-registering keeps the existing counters.
    pub fn register_client(&self, client: &ClientMeta) {
        self.clients.lock().entry(client.client_id).or_insert_with(|| ClientCounters {
            agent: client.agent.clone(),
            ip_address: client.ip_address.clone(),
            start_time: epoch_ms(),
            meter: RateMeter::new(RATE_WINDOW),
            read_wait: Duration::ZERO,
        });
    }

    pub fn unregister_client(&self, client_id: &ClientId) -> bool {
        self.clients.lock().remove(client_id).is_some()
    }

    /// Count bytes delivered to a client. Unknown ids are ignored: a read can
    /// complete after its client detached.
    pub fn add_bytes_read(&self, client_id: &ClientId, count: u64) {
        if let Some(counters) = self.clients.lock().get_mut(client_id) {
            counters.meter.add(count);
        }
    }

    /// Record how long a client's read blocked before data arrived.
    pub fn record_read_wait(&self, client_id: &ClientId, waited: Duration) {
        if let Some(counters) = self.clients.lock().get_mut(client_id) {
            counters.read_wait = waited;
        }
    }

    pub fn snapshot(&self) -> Vec<ClientStatistics> {
        let now = Instant::now();
        self.clients.lock().iter().map(|(id, c)| client_snapshot(id, c, now)).collect()
    }

    pub fn snapshot_by_ids(&self, ids: &[ClientId]) -> Vec<ClientStatistics> {
        let now = Instant::now();
        let clients = self.clients.lock();
        ids.iter()
            .filter_map(|id| clients.get(id).map(|c| client_snapshot(id, c, now)))
            .collect()
    }

    /// Join every client snapshot with the session's input counters.
    pub fn aggregate_with_input(
        &self,
        session_id: SessionId,
        info: &StreamInfo,
        input: &InputSnapshot,
    ) -> Vec<StreamStatisticsResult> {
        self.snapshot()
            .into_iter()
            .map(|client| StreamStatisticsResult {
                id: Uuid::new_v4(),
                session_id,
                channel_id: info.channel_id.clone(),
                channel_name: info.channel_name.clone(),
                video_stream_id: info.video_stream_id.clone(),
                video_stream_name: info.video_stream_name.clone(),
                stream_url: info.stream_url.clone(),
                logo: info.logo.clone(),
                rank: info.rank,
                input_bytes_read: input.bytes_read,
                input_bytes_written: input.bytes_written,
                input_bits_per_second: input.bits_per_second,
                input_start_time: input.start_time,
                input_arrival_ms: input.arrival_ms,
                client_id: client.client_id,
                client_agent: client.client_agent,
                client_ip_address: client.client_ip_address,
                client_bytes_read: client.bytes_read,
                client_bits_per_second: client.bits_per_second,
                client_read_wait_ms: client.read_wait_ms,
                client_start_time: client.start_time,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.clients.lock().clear();
    }
}

fn client_snapshot(id: &ClientId, c: &ClientCounters, now: Instant) -> ClientStatistics {
    ClientStatistics {
        client_id: *id,
        client_agent: c.agent.clone(),
        client_ip_address: c.ip_address.clone(),
        bytes_read: c.meter.total(),
        bits_per_second: c.meter.bits_per_second_at(now),
        read_wait_ms: c.read_wait.as_millis() as u64,
        start_time: c.start_time,
    }
}

/// Upstream-side counters for a session.
pub struct InputStatistics {
    read: RateMeter,
    bytes_written: u64,
    write_errors: u64,
    start_time: u64,
    last_arrival: Option<Instant>,
    /// Gap between the two most recent chunks.
    arrival_gap: Duration,
}

impl Default for InputStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl InputStatistics {
    pub fn new() -> Self {
        Self {
            read: RateMeter::new(RATE_WINDOW),
            bytes_written: 0,
            write_errors: 0,
            start_time: epoch_ms(),
            last_arrival: None,
            arrival_gap: Duration::ZERO,
        }
    }

    /// Record a chunk received from the producer and how much of it reached the buffer.
    pub fn record(&mut self, received: usize, written: usize) {
        self.record_at(received, written, Instant::now());
    }

    pub fn record_at(&mut self, received: usize, written: usize, now: Instant) {
        self.read.add_at(received as u64, now);
        self.bytes_written += written as u64;
        if let Some(prev) = self.last_arrival.replace(now) {
            self.arrival_gap = now.saturating_duration_since(prev);
        }
    }

    /// Count a producer failure.
    pub fn record_error(&mut self) {
        self.write_errors += 1;
    }

    pub fn refresh(&mut self) {
        self.read.sample(Instant::now());
    }

    pub fn snapshot(&self) -> InputSnapshot {
        InputSnapshot {
            bytes_read: self.read.total(),
            bytes_written: self.bytes_written,
            bits_per_second: self.read.bits_per_second(),
            write_errors: self.write_errors,
            start_time: self.start_time,
            arrival_ms: self.arrival_gap.as_millis() as u64,
        }
    }
}

/// Point-in-time copy of [`InputStatistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bits_per_second: u64,
    pub write_errors: u64,
    pub start_time: u64,
    /// Milliseconds between the two most recent upstream chunks.
    pub arrival_ms: u64,
}

/// One reporting row: a client joined with its session's upstream counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatisticsResult {
    /// Fresh correlation id for this row.
    pub id: Uuid,
    pub session_id: SessionId,
    pub channel_id: String,
    pub channel_name: String,
    pub video_stream_id: String,
    pub video_stream_name: String,
    pub stream_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    pub rank: u32,
    pub input_bytes_read: u64,
    pub input_bytes_written: u64,
    pub input_bits_per_second: u64,
    pub input_start_time: u64,
    pub input_arrival_ms: u64,
    pub client_id: ClientId,
    pub client_agent: String,
    pub client_ip_address: String,
    pub client_bytes_read: u64,
    pub client_bits_per_second: u64,
    pub client_read_wait_ms: u64,
    pub client_start_time: u64,
}

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;
