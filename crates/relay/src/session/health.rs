// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic buffer health check: growth under sustained overwrites and
//! lagging-client warnings.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::StreamSession;
use crate::events::RelayEvent;
use crate::ClientId;

/// What one health pass observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Overwrite events since the previous pass.
    pub drops: u64,
    /// `(old, new)` capacity when the ring grew.
    pub resized: Option<(usize, usize)>,
    /// Clients whose backlog is close to the capacity, with their backlog.
    pub lagging: Vec<(ClientId, u64)>,
}

impl StreamSession {
    /// Run one health pass.
    pub fn evaluate_health(&self) -> HealthReport {
        self.input.lock().refresh();

        let drops = self.cursors.take_drop_events();
        let mut resized = None;
        if drops >= self.config.drop_threshold && drops > 0 {
            resized = self.ring.grow();
            match resized {
                Some((old_capacity, new_capacity)) => {
                    tracing::info!(
                        session = %self.id,
                        drops,
                        old_capacity,
                        new_capacity,
                        "buffer grown after repeated overwrites"
                    );
                    self.emit(RelayEvent::BufferResized {
                        session: self.id,
                        old_capacity,
                        new_capacity,
                    });
                }
                None => {
                    tracing::debug!(session = %self.id, drops, "buffer already at maximum capacity");
                }
            }
        }

        let lagging = {
            let ring = self.ring.read();
            self.cursors.lagging(&ring, self.config.lag_warn_ratio)
        };
        for (client, backlog) in &lagging {
            tracing::warn!(session = %self.id, client = %client, backlog, "client lagging");
        }

        HealthReport { drops, resized, lagging }
    }
}

pub(super) fn spawn_health_monitor(session: Arc<StreamSession>) -> JoinHandle<()> {
    tokio::spawn(async move {
        // interval() rejects a zero period.
        let period = session.config.health_check_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => break,
                _ = interval.tick() => {
                    session.evaluate_health();
                }
            }
        }
    })
}
