// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Registry of live sessions and the operations exposed to the HTTP layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RelayError;
use crate::events::{RelayEvent, EVENT_CHANNEL_CAPACITY};
use crate::session::{
    ClientMeta, ClientReader, FailoverList, SessionConfig, StreamInfo, StreamSession, StreamSource,
    UpstreamFactory,
};
use crate::stats::StreamStatisticsResult;
use crate::{ClientId, SessionId};

/// Opaque handle returned by [`RelayManager::start_session`].
pub type SessionHandle = SessionId;

/// Parameters for a new session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub info: StreamInfo,
    /// Candidate sources in failover order.
    pub sources: Vec<StreamSource>,
    pub buffer_size: Option<usize>,
    pub max_streams: Option<usize>,
}

impl StartRequest {
    pub fn new(info: StreamInfo, sources: Vec<StreamSource>) -> Self {
        Self { info, sources, buffer_size: None, max_streams: None }
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = Some(bytes);
        self
    }

    pub fn with_max_streams(mut self, max: usize) -> Self {
        self.max_streams = Some(max);
        self
    }
}

/// Owns every live [`StreamSession`].
pub struct RelayManager {
    sessions: RwLock<HashMap<SessionId, Arc<StreamSession>>>,
    config: SessionConfig,
    factory: Arc<dyn UpstreamFactory>,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayManager {
    pub fn new(config: SessionConfig, factory: Arc<dyn UpstreamFactory>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sessions: RwLock::new(HashMap::new()), config, factory, events }
    }

    /// Receive lifecycle events from every session.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Create a session and start pulling from its first source.
    pub fn start_session(&self, request: StartRequest) -> Result<SessionHandle, RelayError> {
        if request.sources.is_empty() {
            return Err(RelayError::SourcesExhausted);
        }

        let mut config = self.config.clone();
        if let Some(bytes) = request.buffer_size {
            config.buffer_size = bytes;
        }
        if let Some(max) = request.max_streams {
            config.max_streams = max;
        }

        let id = Uuid::new_v4();
        let session = StreamSession::start(
            id,
            request.info,
            config,
            Box::new(FailoverList::new(request.sources)),
            Arc::clone(&self.factory),
            self.events.clone(),
        );
        self.sessions.write().insert(id, session);
        Ok(id)
    }

    pub fn session(&self, handle: SessionHandle) -> Result<Arc<StreamSession>, RelayError> {
        self.sessions.read().get(&handle).cloned().ok_or(RelayError::SessionNotFound(handle))
    }

    pub fn attach_client(
        &self,
        handle: SessionHandle,
        client: ClientMeta,
    ) -> Result<ClientReader, RelayError> {
        self.session(handle)?.attach_client(client)
    }

    /// Detach a client. Returns whether it was attached.
    pub fn detach_client(
        &self,
        handle: SessionHandle,
        client_id: &ClientId,
    ) -> Result<bool, RelayError> {
        let session = self.session(handle)?;
        let removed = session.detach_client(client_id);
        if session.is_stopped() {
            self.sessions.write().remove(&handle);
        }
        Ok(removed)
    }

    pub fn get_statistics(
        &self,
        handle: SessionHandle,
    ) -> Result<Vec<StreamStatisticsResult>, RelayError> {
        Ok(self.session(handle)?.statistics())
    }

    /// Statistics rows for every client of every session.
    pub fn all_statistics(&self) -> Vec<StreamStatisticsResult> {
        let sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.iter().flat_map(|s| s.statistics()).collect()
    }

    pub fn stop_session(&self, handle: SessionHandle) -> Result<(), RelayError> {
        let session =
            self.sessions.write().remove(&handle).ok_or(RelayError::SessionNotFound(handle))?;
        session.stop();
        Ok(())
    }

    /// A live session already streaming `url` that can take another client.
    pub fn find_session(&self, url: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .values()
            .find(|s| s.has_capacity() && s.info().stream_url == url)
            .map(|s| s.id())
    }

    pub fn session_ids(&self) -> Vec<SessionHandle> {
        self.sessions.read().keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop sessions that stopped on their own. Returns how many were removed.
    pub fn reap(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_stopped());
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "reaped stopped sessions");
        }
        removed
    }

    /// Stop and forget every session.
    pub fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop();
        }
    }

    /// Periodically reap stopped sessions until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap();
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
