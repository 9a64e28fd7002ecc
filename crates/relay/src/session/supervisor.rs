// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Producer supervision and source failover.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::source::{SourceResolver, StreamSource};
use super::upstream::{ProducerGuard, UpstreamFactory};
use super::{SessionState, StreamSession};
use crate::events::RelayEvent;

/// How one producer run ended.
enum RunOutcome {
    Cancelled,
    Failed(String),
}

/// Drive producers for `session` until it stops or sources run out.
///
/// Each failure moves the session through `Failing` and `Restarting` to the
/// next candidate. The ring, cursors and statistics are left untouched so
/// attached clients keep reading across the switch.
pub(super) async fn run(
    session: Arc<StreamSession>,
    mut resolver: Box<dyn SourceResolver>,
    factory: Arc<dyn UpstreamFactory>,
) {
    let id = session.id;
    let mut attempt: u32 = 0;

    while !session.cancel.is_cancelled() {
        let Some(source) = resolver.next_source() else {
            tracing::warn!(session = %id, attempts = attempt, "all stream sources exhausted");
            session.exhausted.store(true, Ordering::SeqCst);
            session.emit(RelayEvent::SourcesExhausted { session: id });
            session.stop();
            return;
        };
        attempt += 1;

        session.failover_in_progress.store(true, Ordering::SeqCst);
        session.set_state(SessionState::Starting);
        tracing::info!(session = %id, url = %source.url, attempt, "starting producer");

        match run_source(&session, &source, factory.as_ref()).await {
            RunOutcome::Cancelled => return,
            RunOutcome::Failed(reason) => {
                session.set_state(SessionState::Failing);
                session.input.lock().record_error();
                tracing::warn!(session = %id, url = %source.url, reason = %reason, "upstream failed");
                session.emit(RelayEvent::UpstreamFailed {
                    session: id,
                    url: source.url.clone(),
                    reason,
                });
                session.release_producer();
            }
        }

        if session.cancel.is_cancelled() {
            return;
        }
        session.set_state(SessionState::Restarting);
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(session.config.restart_delay) => {}
        }
    }
}

/// Launch one source and pump its output into the ring until it ends.
async fn run_source(
    session: &StreamSession,
    source: &StreamSource,
    factory: &dyn UpstreamFactory,
) -> RunOutcome {
    let upstream = match factory.open(source) {
        Ok(upstream) => upstream,
        Err(e) => return RunOutcome::Failed(format!("{e:#}")),
    };

    let (output_tx, mut output_rx) = mpsc::channel(session.config.producer_channel_capacity);
    let (guard, mut done_rx) =
        ProducerGuard::spawn(upstream, source.clone(), &session.cancel, output_tx);
    if !session.install_producer(guard) {
        return RunOutcome::Cancelled;
    }
    session.emit(RelayEvent::SourceStarted { session: session.id, url: source.url.clone() });

    pump(session, &mut output_rx, &mut done_rx).await
}

async fn pump(
    session: &StreamSession,
    output_rx: &mut mpsc::Receiver<Bytes>,
    done_rx: &mut oneshot::Receiver<anyhow::Result<()>>,
) -> RunOutcome {
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => return RunOutcome::Cancelled,
            chunk = output_rx.recv() => match chunk {
                Some(data) => session.ingest(&data),
                // Sender dropped: the producer's run future has finished.
                None => break,
            },
        }
    }

    if session.cancel.is_cancelled() {
        return RunOutcome::Cancelled;
    }
    match done_rx.await {
        Ok(Ok(())) => RunOutcome::Failed("upstream ended".to_owned()),
        Ok(Err(e)) => RunOutcome::Failed(format!("{e:#}")),
        Err(_) => RunOutcome::Failed("producer task terminated".to_owned()),
    }
}
