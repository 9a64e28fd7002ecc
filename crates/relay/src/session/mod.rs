// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One upstream channel shared by many downstream clients.
//!
//! A session owns a ring buffer, the client cursors into it, and the
//! producer feeding it. The producer runs under a supervisor that fails over
//! to the next candidate source while the buffer and cursors stay in place.

mod health;
mod reader;
pub mod source;
mod supervisor;
pub mod upstream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::cursor::ClientCursorRegistry;
use crate::error::RelayError;
use crate::events::RelayEvent;
use crate::ring::{RingBuffer, SharedRing};
use crate::stats::{InputStatistics, StatisticsManager, StreamStatisticsResult};
use crate::{ClientId, SessionId};

pub use health::HealthReport;
pub use reader::{ClientReader, ReadOutcome};
pub use source::{FailoverList, IngestMode, SourceResolver, StreamInfo, StreamSource};
pub use upstream::{
    terminate_process, DefaultUpstreams, HttpUpstream, ProcessHandle, ProcessUpstream,
    ProducerGuard, Upstream, UpstreamFactory,
};

/// Producer lifecycle as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// A producer was launched and has not delivered data yet.
    Starting,
    Streaming,
    /// The producer died; failover is about to run.
    Failing,
    /// Waiting to launch the next candidate source.
    Restarting,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Failing => "failing",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a downstream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMeta {
    pub client_id: ClientId,
    pub agent: String,
    pub ip_address: String,
}

impl ClientMeta {
    pub fn new(client_id: ClientId, agent: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self { client_id, agent: agent.into(), ip_address: ip_address.into() }
    }
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial ring buffer capacity in bytes.
    pub buffer_size: usize,
    /// Maximum capacity as a multiple of `buffer_size`.
    pub growth_factor: usize,
    pub max_streams: usize,
    /// Upper bound on one client read.
    pub read_chunk_size: usize,
    pub health_check_interval: Duration,
    /// Drop events per health interval that trigger growth.
    pub drop_threshold: u64,
    /// Backlog ratio above which a client is logged as lagging.
    pub lag_warn_ratio: f64,
    /// Chunks buffered between the producer task and the ring.
    pub producer_channel_capacity: usize,
    /// Pause before launching the next candidate source.
    pub restart_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4 * 1024 * 1024,
            growth_factor: 4,
            max_streams: 10,
            read_chunk_size: 64 * 1024,
            health_check_interval: Duration::from_secs(5),
            drop_threshold: 3,
            lag_warn_ratio: 0.9,
            producer_channel_capacity: 64,
            restart_delay: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn with_growth_factor(mut self, factor: usize) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = max;
        self
    }

    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_drop_threshold(mut self, threshold: u64) -> Self {
        self.drop_threshold = threshold;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }
}

/// A live channel: ring buffer, client cursors, statistics and producer.
pub struct StreamSession {
    id: SessionId,
    info: RwLock<StreamInfo>,
    config: SessionConfig,
    ring: SharedRing,
    cursors: ClientCursorRegistry,
    stats: Arc<StatisticsManager>,
    input: Mutex<InputStatistics>,
    state_tx: watch::Sender<SessionState>,
    /// Set while a freshly launched producer has not delivered data.
    failover_in_progress: AtomicBool,
    producer: Mutex<Option<ProducerGuard>>,
    current_url: RwLock<Option<String>>,
    /// Serializes capacity checks against registration and shutdown.
    attach_lock: Mutex<()>,
    stopped: AtomicBool,
    /// Set when the session ends because no source is left; readers may
    /// then drain what the ring still holds.
    exhausted: AtomicBool,
    cancel: CancellationToken,
    events: broadcast::Sender<RelayEvent>,
}

impl StreamSession {
    /// Create a session and launch its supervisor and health monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        id: SessionId,
        info: StreamInfo,
        config: SessionConfig,
        resolver: Box<dyn SourceResolver>,
        factory: Arc<dyn UpstreamFactory>,
        events: broadcast::Sender<RelayEvent>,
    ) -> Arc<Self> {
        let session = Arc::new(Self::new(id, info, config, events));
        let url = session.info.read().stream_url.clone();
        tracing::info!(
            session = %id,
            url = %url,
            buffer_size = session.config.buffer_size,
            max_streams = session.config.max_streams,
            "session started"
        );
        session.emit(RelayEvent::SessionStarted { session: id, url });

        tokio::spawn(supervisor::run(Arc::clone(&session), resolver, factory));
        health::spawn_health_monitor(Arc::clone(&session));
        session
    }

    fn new(
        id: SessionId,
        info: StreamInfo,
        config: SessionConfig,
        events: broadcast::Sender<RelayEvent>,
    ) -> Self {
        let stats = Arc::new(StatisticsManager::new());
        let ring = RingBuffer::with_growth_limit(config.buffer_size, config.growth_factor);
        let (state_tx, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            info: RwLock::new(info),
            config,
            ring: SharedRing::new(ring),
            cursors: ClientCursorRegistry::new(Arc::clone(&stats)),
            stats,
            input: Mutex::new(InputStatistics::new()),
            state_tx,
            failover_in_progress: AtomicBool::new(true),
            producer: Mutex::new(None),
            current_url: RwLock::new(None),
            attach_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
        }
    }

    /// Register a client and hand back its reader.
    pub fn attach_client(self: &Arc<Self>, client: ClientMeta) -> Result<ClientReader, RelayError> {
        let read_index = {
            let _guard = self.attach_lock.lock();
            if self.is_stopped() {
                return Err(RelayError::SessionStopped);
            }
            if self.cursors.len() >= self.config.max_streams {
                tracing::warn!(
                    session = %self.id,
                    client = %client.client_id,
                    max_streams = self.config.max_streams,
                    "session at capacity"
                );
                return Err(RelayError::CapacityExceeded { max_streams: self.config.max_streams });
            }
            let ring = self.ring.read();
            self.cursors.register(&client, &ring)?
        };

        tracing::info!(
            session = %self.id,
            client = %client.client_id,
            agent = %client.agent,
            ip = %client.ip_address,
            read_index,
            "client attached"
        );
        self.emit(RelayEvent::ClientAttached {
            session: self.id,
            client: client.client_id,
            read_index,
        });
        Ok(ClientReader::new(Arc::clone(self), client.client_id))
    }

    /// Remove a client. Idempotent; the last client leaving stops the session.
    pub fn detach_client(&self, client_id: &ClientId) -> bool {
        let (removed, now_empty) = {
            let _guard = self.attach_lock.lock();
            let removed = self.cursors.unregister(client_id);
            (removed, self.cursors.is_empty())
        };
        if !removed {
            return false;
        }

        tracing::info!(session = %self.id, client = %client_id, "client detached");
        self.emit(RelayEvent::ClientDetached { session: self.id, client: *client_id });
        if now_empty && !self.is_stopped() {
            tracing::info!(session = %self.id, "last client left, stopping session");
            self.stop();
        }
        true
    }

    /// Tear the session down. Only the first call has any effect.
    ///
    /// Cursors are dropped at once unless the sources ran out, in which case
    /// attached readers keep theirs until they have drained the ring.
    pub fn stop(&self) {
        {
            let _guard = self.attach_lock.lock();
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            if !self.is_exhausted() {
                self.cursors.clear();
            }
        }
        self.cancel.cancel();
        if let Some(guard) = self.producer.lock().take() {
            guard.release();
        }
        self.stats.clear();
        self.set_state(SessionState::Stopped);
        tracing::info!(session = %self.id, "session stopped");
        self.emit(RelayEvent::SessionStopped { session: self.id });
    }

    /// One statistics row per attached client.
    pub fn statistics(&self) -> Vec<StreamStatisticsResult> {
        let input = self.input.lock().snapshot();
        let info = self.info.read();
        self.stats.aggregate_with_input(self.id, &info, &input)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn info(&self) -> StreamInfo {
        self.info.read().clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the session ended because every candidate source failed.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.cursors.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.cursors.client_ids()
    }

    /// Whether another client could attach right now.
    pub fn has_capacity(&self) -> bool {
        !self.is_stopped() && self.cursors.len() < self.config.max_streams
    }

    pub fn buffer_capacity(&self) -> usize {
        self.ring.read().capacity()
    }

    pub fn total_written(&self) -> u64 {
        self.ring.read().total_written()
    }

    /// URL the running producer pulls from, if one is running.
    pub fn current_url(&self) -> Option<String> {
        self.current_url.read().clone()
    }

    /// Process id of the running producer when it is an external process.
    pub fn producer_pid(&self) -> Option<u32> {
        self.producer.lock().as_ref().and_then(ProducerGuard::process_id)
    }

    /// Resolves once the session is stopped.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Move a chunk from the producer into the ring.
    fn ingest(&self, data: &[u8]) {
        let written = self.ring.write(data);
        self.input.lock().record(data.len(), written);
        if self.failover_in_progress.swap(false, Ordering::SeqCst) {
            tracing::info!(session = %self.id, url = ?self.current_url(), "streaming");
            self.set_state(SessionState::Streaming);
        }
    }

    /// Swap in a new producer, releasing the previous one.
    ///
    /// Returns `false` and releases `guard` when the session already stopped.
    fn install_producer(&self, guard: ProducerGuard) -> bool {
        let url = guard.source().url.clone();
        let previous = {
            let mut slot = self.producer.lock();
            // Checked under the slot lock: stop() flags first, then empties the slot.
            if self.is_stopped() {
                drop(slot);
                guard.release();
                return false;
            }
            slot.replace(guard)
        };
        *self.current_url.write() = Some(url);
        if let Some(previous) = previous {
            previous.release();
        }
        true
    }

    fn release_producer(&self) {
        let guard = self.producer.lock().take();
        if let Some(guard) = guard {
            guard.release();
        }
        *self.current_url.write() = None;
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(session = %self.id, %prev, %next, "session state");
        }
    }

    fn emit(&self, event: RelayEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
