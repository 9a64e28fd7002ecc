// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::*;
use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::test_support::{ScriptEnd, ScriptedFactory, UpstreamScript};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> SessionConfig {
    SessionConfig::default()
        .with_buffer_size(1024)
        .with_max_streams(3)
        .with_restart_delay(Duration::from_millis(10))
        .with_health_check_interval(Duration::from_secs(3600))
}

fn start(
    factory: Arc<ScriptedFactory>,
    urls: &[&str],
    config: SessionConfig,
) -> (Arc<StreamSession>, broadcast::Receiver<RelayEvent>) {
    let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let resolver = FailoverList::new(urls.iter().map(|u| StreamSource::http(*u)));
    let info = StreamInfo::new(urls.first().copied().unwrap_or_default());
    let session =
        StreamSession::start(Uuid::new_v4(), info, config, Box::new(resolver), factory, events);
    (session, rx)
}

fn idle() -> Arc<ScriptedFactory> {
    ScriptedFactory::new().with_script("http://idle", UpstreamScript::new(Vec::<Bytes>::new())).into_arc()
}

fn client() -> ClientMeta {
    ClientMeta::new(Uuid::new_v4(), "test-agent", "127.0.0.1")
}

fn drain(rx: &mut broadcast::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// Collect `n` bytes of data, ignoring overwrite markers.
async fn read_exact(reader: &mut ClientReader, n: usize) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    while out.len() < n {
        match tokio::time::timeout(WAIT, reader.next()).await?? {
            ReadOutcome::Data(data) | ReadOutcome::Overwritten { data, .. } => {
                out.extend_from_slice(&data)
            }
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Closed => anyhow::bail!("closed after {} bytes", out.len()),
        }
    }
    Ok(out)
}

#[tokio::test]
async fn capacity_is_enforced_and_freed_on_detach() -> anyhow::Result<()> {
    let (session, _events) = start(idle(), &["http://idle"], config());

    let mut readers = Vec::new();
    for _ in 0..3 {
        readers.push(session.attach_client(client())?);
    }
    assert!(!session.has_capacity());

    let err = session.attach_client(client()).err();
    assert_eq!(err, Some(RelayError::CapacityExceeded { max_streams: 3 }));
    assert_eq!(session.client_count(), 3);

    let first = readers.remove(0);
    first.detach();
    assert_eq!(session.client_count(), 2);
    readers.push(session.attach_client(client())?);
    assert_eq!(session.client_count(), 3);

    session.stop();
    Ok(())
}

#[tokio::test]
async fn duplicate_attach_is_rejected() -> anyhow::Result<()> {
    let (session, _events) = start(idle(), &["http://idle"], config());
    let meta = client();
    let _reader = session.attach_client(meta.clone())?;

    let err = session.attach_client(meta.clone()).err();
    assert_eq!(err, Some(RelayError::DuplicateClient(meta.client_id)));
    assert_eq!(session.client_count(), 1);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn every_client_sees_the_stream_in_order() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .with_script(
            "http://a",
            UpstreamScript::new(["hello", " ", "world"]).with_delay(Duration::from_millis(5)),
        )
        .into_arc();
    let (session, _events) = start(factory, &["http://a"], config());

    let mut a = session.attach_client(client())?;
    let mut b = session.attach_client(client())?;
    assert_eq!(read_exact(&mut a, 11).await?, b"hello world");
    assert_eq!(read_exact(&mut b, 11).await?, b"hello world");

    let mut state = session.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Streaming)).await??;
    session.stop();
    Ok(())
}

#[tokio::test]
async fn failover_keeps_clients_and_buffer() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .with_script("http://a", UpstreamScript::new(["abc"]).ending(ScriptEnd::Fail("reset".into())))
        .with_script("http://b", UpstreamScript::new(["def"]))
        .into_arc();
    let (session, mut events) = start(Arc::clone(&factory), &["http://a", "http://b"], config());

    let mut reader = session.attach_client(client())?;
    assert_eq!(read_exact(&mut reader, 6).await?, b"abcdef");
    assert_eq!(factory.opened(), vec!["http://a".to_owned(), "http://b".to_owned()]);
    assert_eq!(session.current_url().as_deref(), Some("http://b"));
    assert_eq!(session.client_count(), 1);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(
        e,
        RelayEvent::UpstreamFailed { url, reason, .. } if url == "http://a" && reason.contains("reset")
    )));
    assert!(seen.contains(&RelayEvent::SourceStarted { session: session.id(), url: "http://b".into() }));

    let rows = session.statistics();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].input_bytes_read, 6);
    assert_eq!(rows[0].client_bytes_read, 6);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn unopenable_source_fails_over() -> anyhow::Result<()> {
    // "http://missing" has no script, so opening it fails.
    let factory = ScriptedFactory::new().with_script("http://b", UpstreamScript::new(["ok"])).into_arc();
    let (session, _events) = start(Arc::clone(&factory), &["http://missing", "http://b"], config());

    let mut reader = session.attach_client(client())?;
    assert_eq!(read_exact(&mut reader, 2).await?, b"ok");
    assert_eq!(factory.opened().len(), 2);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn exhausted_sources_close_readers() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .with_script("http://a", UpstreamScript::new(["x"]).ending(ScriptEnd::Eof))
        .into_arc();
    let (session, mut events) = start(factory, &["http://a"], config());
    let mut reader = session.attach_client(client())?;

    let mut closed = false;
    for _ in 0..4 {
        if tokio::time::timeout(WAIT, reader.next()).await?? == ReadOutcome::Closed {
            closed = true;
            break;
        }
    }
    assert!(closed);
    assert!(session.is_stopped());
    assert_eq!(session.state(), SessionState::Stopped);

    let seen = drain(&mut events);
    assert!(seen.contains(&RelayEvent::SourcesExhausted { session: session.id() }));
    assert!(seen.contains(&RelayEvent::SessionStopped { session: session.id() }));

    assert_eq!(session.attach_client(client()).err(), Some(RelayError::SessionStopped));
    Ok(())
}

#[tokio::test]
async fn last_detach_stops_session() -> anyhow::Result<()> {
    let (session, mut events) = start(idle(), &["http://idle"], config());
    let a = session.attach_client(client())?;
    let b = session.attach_client(client())?;

    drop(a);
    assert!(!session.is_stopped());
    assert_eq!(session.client_count(), 1);

    let b_id = b.client_id();
    b.detach();
    assert!(session.is_stopped());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!session.detach_client(&b_id));

    let stops = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, RelayEvent::SessionStopped { .. }))
        .count();
    assert_eq!(stops, 1);
    Ok(())
}

#[tokio::test]
async fn stop_is_idempotent() -> anyhow::Result<()> {
    let (session, mut events) = start(idle(), &["http://idle"], config());
    let mut reader = session.attach_client(client())?;
    session.stop();
    session.stop();

    assert_eq!(reader.try_read()?, ReadOutcome::Closed);
    assert!(session.statistics().is_empty());
    assert_eq!(session.producer_pid(), None);
    let stops = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, RelayEvent::SessionStopped { .. }))
        .count();
    assert_eq!(stops, 1);
    Ok(())
}

#[tokio::test]
async fn late_joiner_starts_past_oldest_data() -> anyhow::Result<()> {
    let (session, mut events) =
        start(idle(), &["http://idle"], config().with_buffer_size(1000));
    session.ingest(&[1u8; 1500]);

    let reader = session.attach_client(client())?;
    let attached = drain(&mut events).into_iter().find_map(|e| match e {
        RelayEvent::ClientAttached { client, read_index, .. } if client == reader.client_id() => {
            Some(read_index)
        }
        _ => None,
    });
    assert_eq!(attached, Some(600));
    session.stop();
    Ok(())
}

#[tokio::test]
async fn lapped_reader_gets_overwritten_outcome() -> anyhow::Result<()> {
    let (session, mut events) = start(idle(), &["http://idle"], config().with_buffer_size(10));
    let mut reader = session.attach_client(client())?;

    session.ingest(&(0u8..25).collect::<Vec<_>>());
    match reader.try_read()? {
        ReadOutcome::Overwritten { data, skipped } => {
            assert_eq!(skipped, 16);
            assert_eq!(&data[..], &(16u8..25).collect::<Vec<_>>()[..]);
        }
        other => anyhow::bail!("expected overwrite, got {other:?}"),
    }
    assert_eq!(reader.try_read()?, ReadOutcome::WouldBlock);

    let skipped = drain(&mut events).into_iter().find_map(|e| match e {
        RelayEvent::ClientOverwritten { skipped, .. } => Some(skipped),
        _ => None,
    });
    assert_eq!(skipped, Some(16));
    session.stop();
    Ok(())
}

#[tokio::test]
async fn reads_are_capped_at_chunk_size() -> anyhow::Result<()> {
    let (session, _events) =
        start(idle(), &["http://idle"], config().with_read_chunk_size(4));
    let mut reader = session.attach_client(client())?;
    session.ingest(b"0123456789");

    assert_eq!(reader.try_read()?, ReadOutcome::Data(Bytes::from_static(b"0123")));
    assert_eq!(reader.try_read()?, ReadOutcome::Data(Bytes::from_static(b"4567")));
    assert_eq!(reader.try_read()?, ReadOutcome::Data(Bytes::from_static(b"89")));
    assert_eq!(reader.try_read()?, ReadOutcome::WouldBlock);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn repeated_overwrites_grow_the_buffer() -> anyhow::Result<()> {
    let (session, mut events) = start(
        idle(),
        &["http://idle"],
        config().with_buffer_size(100).with_drop_threshold(2),
    );
    let mut reader = session.attach_client(client())?;

    session.ingest(&[0u8; 250]);
    assert!(matches!(reader.try_read()?, ReadOutcome::Overwritten { .. }));
    let report = session.evaluate_health();
    assert_eq!(report.drops, 1);
    assert_eq!(report.resized, None);

    session.ingest(&[0u8; 250]);
    assert!(matches!(reader.try_read()?, ReadOutcome::Overwritten { .. }));
    session.ingest(&[0u8; 250]);
    assert!(matches!(reader.try_read()?, ReadOutcome::Overwritten { .. }));

    let report = session.evaluate_health();
    assert_eq!(report.drops, 2);
    assert_eq!(report.resized, Some((100, 120)));
    assert_eq!(session.buffer_capacity(), 120);
    assert!(drain(&mut events).contains(&RelayEvent::BufferResized {
        session: session.id(),
        old_capacity: 100,
        new_capacity: 120,
    }));
    session.stop();
    Ok(())
}

#[tokio::test]
async fn health_reports_lagging_clients() -> anyhow::Result<()> {
    let (session, _events) = start(idle(), &["http://idle"], config().with_buffer_size(100));
    let slow = session.attach_client(client())?;
    let mut fast = session.attach_client(client())?;

    session.ingest(&[0u8; 95]);
    assert!(matches!(fast.try_read()?, ReadOutcome::Data(_)));

    let report = session.evaluate_health();
    assert_eq!(report.drops, 0);
    assert_eq!(report.lagging, vec![(slow.client_id(), 95)]);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn cursor_position_survives_failover() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .with_script(
            "http://a",
            UpstreamScript::new(["abc"])
                .with_delay(Duration::from_millis(200))
                .ending(ScriptEnd::Fail("reset".into())),
        )
        .with_script("http://b", UpstreamScript::new(["def"]))
        .into_arc();
    let config = config().with_restart_delay(Duration::from_millis(200));
    let (session, _events) = start(factory, &["http://a", "http://b"], config);
    let mut reader = session.attach_client(client())?;
    let id = reader.client_id();

    assert_eq!(read_exact(&mut reader, 3).await?, b"abc");
    let before = session.cursors.position(&id);
    assert_eq!(before, Some(3));

    let mut state = session.subscribe_state();
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Restarting)).await??;
    assert_eq!(session.cursors.position(&id), before);
    assert_eq!(session.client_count(), 1);

    assert_eq!(read_exact(&mut reader, 3).await?, b"def");
    assert_eq!(session.cursors.position(&id), Some(6));
    session.stop();
    Ok(())
}

#[tokio::test]
async fn exhausted_session_drains_before_closing() -> anyhow::Result<()> {
    let factory = ScriptedFactory::new()
        .with_script("http://a", UpstreamScript::new(["abc"]).ending(ScriptEnd::Eof))
        .into_arc();
    let (session, _events) = start(factory, &["http://a"], config());
    let mut reader = session.attach_client(client())?;

    tokio::time::timeout(WAIT, session.stopped()).await?;
    assert!(session.is_exhausted());
    assert_eq!(reader.try_read()?, ReadOutcome::Data(Bytes::from_static(b"abc")));
    assert_eq!(reader.try_read()?, ReadOutcome::Closed);
    assert_eq!(tokio::time::timeout(WAIT, reader.next()).await??, ReadOutcome::Closed);
    Ok(())
}

#[tokio::test]
async fn explicit_stop_closes_without_draining() -> anyhow::Result<()> {
    let (session, _events) = start(idle(), &["http://idle"], config());
    let mut reader = session.attach_client(client())?;
    session.ingest(b"unread");

    session.stop();
    assert!(!session.is_exhausted());
    assert_eq!(reader.try_read()?, ReadOutcome::Closed);
    assert_eq!(session.client_count(), 0);
    Ok(())
}

#[tokio::test]
async fn blocked_read_records_its_wait() -> anyhow::Result<()> {
    let (session, _events) = start(idle(), &["http://idle"], config());
    let mut reader = session.attach_client(client())?;

    let writer = Arc::clone(&session);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        writer.ingest(b"late");
    });
    assert_eq!(
        tokio::time::timeout(WAIT, reader.next()).await??,
        ReadOutcome::Data(Bytes::from_static(b"late"))
    );

    let rows = session.statistics();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].client_read_wait_ms >= 50, "wait {}", rows[0].client_read_wait_ms);
    session.stop();
    Ok(())
}
