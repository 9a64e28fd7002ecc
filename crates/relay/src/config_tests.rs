// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use clap::Parser;

use super::{Config, IngestKind};
use crate::session::IngestMode;

fn parse(args: &[&str]) -> Config {
    Config::parse_from(args)
}

#[test]
fn minimal_config_is_valid() -> anyhow::Result<()> {
    let config = parse(&["streamrelay", "--source", "http://a/live.ts"]);
    config.validate()?;
    assert_eq!(config.ingest_kind()?, IngestKind::Http);
    assert_eq!(config.buffer_size, 4 * 1024 * 1024);
    assert_eq!(config.max_streams, 10);
    assert_eq!(config.output_path(), None);
    Ok(())
}

#[test]
fn sources_keep_their_order() -> anyhow::Result<()> {
    let config = parse(&[
        "streamrelay",
        "--source",
        "http://primary",
        "--source",
        "http://backup-1,http://backup-2",
    ]);
    let urls: Vec<String> = config.stream_sources()?.into_iter().map(|s| s.url).collect();
    assert_eq!(urls, vec!["http://primary", "http://backup-1", "http://backup-2"]);
    assert_eq!(config.stream_info().stream_url, "http://primary");
    Ok(())
}

#[yare::parameterized(
    no_source      = { &["streamrelay"], "--source" },
    zero_buffer    = { &["streamrelay", "--source", "http://a", "--buffer-size", "0"], "--buffer-size" },
    zero_growth    = { &["streamrelay", "--source", "http://a", "--max-growth-factor", "0"], "growth" },
    zero_streams   = { &["streamrelay", "--source", "http://a", "--max-streams", "0"], "--max-streams" },
    zero_chunk     = { &["streamrelay", "--source", "http://a", "--read-chunk-size", "0"], "chunk" },
    zero_health    = { &["streamrelay", "--source", "http://a", "--health-check-ms", "0"], "health" },
    zero_downloads = { &["streamrelay", "--source", "http://a", "--max-concurrent-downloads", "0"], "downloads" },
    bad_ingest     = { &["streamrelay", "--source", "http://a", "--ingest", "rtsp"], "ingest mode" },
    bad_log_format = { &["streamrelay", "--source", "http://a", "--log-format", "xml"], "log format" },
)]
fn invalid_config(args: &[&str], expected_substr: &str) {
    let config = parse(args);
    crate::assert_err_contains!(config.validate(), expected_substr);
}

#[test]
fn ffmpeg_sources_carry_template() -> anyhow::Result<()> {
    let config = parse(&[
        "streamrelay",
        "--source",
        "http://a/live",
        "--ingest",
        "FFmpeg",
        "--ffmpeg-path",
        "/usr/bin/ffmpeg",
        "--ffmpeg-options",
        "-i {streamUrl} -f mpegts pipe:1",
    ]);
    config.validate()?;
    let sources = config.stream_sources()?;
    assert_eq!(sources.len(), 1);
    match &sources[0].ingest {
        IngestMode::Process { program, args } => {
            assert_eq!(program, "/usr/bin/ffmpeg");
            assert_eq!(args, &["-i", "{streamUrl}", "-f", "mpegts", "pipe:1"]);
        }
        other => anyhow::bail!("expected process ingest, got {other:?}"),
    }
    Ok(())
}

#[test]
fn session_config_mirrors_flags() {
    let config = parse(&[
        "streamrelay",
        "--source",
        "http://a",
        "--buffer-size",
        "1000",
        "--max-growth-factor",
        "2",
        "--max-streams",
        "3",
        "--read-chunk-size",
        "128",
        "--health-check-ms",
        "250",
        "--drop-threshold",
        "5",
    ]);
    let session = config.session_config();
    assert_eq!(session.buffer_size, 1000);
    assert_eq!(session.growth_factor, 2);
    assert_eq!(session.max_streams, 3);
    assert_eq!(session.read_chunk_size, 128);
    assert_eq!(session.health_check_interval, Duration::from_millis(250));
    assert_eq!(session.drop_threshold, 5);
}

#[test]
fn download_config_mirrors_flags() {
    let config = parse(&[
        "streamrelay",
        "--source",
        "http://a",
        "--max-concurrent-downloads",
        "3",
        "--download-cooldown-secs",
        "30",
        "--user-agent",
        "relay/1",
    ]);
    let download = config.download_config();
    assert_eq!(download.max_concurrent, 3);
    assert_eq!(download.cooldown, Duration::from_secs(30));
    assert_eq!(download.user_agent, "relay/1");
    assert_eq!(download.min_bytes, 2000);
}

#[test]
fn duration_overrides_win() {
    let config = Config::test();
    assert_eq!(config.restart_delay(), Duration::from_millis(10));
    assert_eq!(config.reap_poll(), Duration::from_millis(10));
    assert_eq!(config.stats_interval(), None);
}

#[test]
fn output_path_for_file() {
    let config = parse(&["streamrelay", "--source", "http://a", "--output", "/tmp/out.ts"]);
    assert_eq!(config.output_path().as_deref(), Some(std::path::Path::new("/tmp/out.ts")));
}

#[test]
fn logo_flows_into_stream_info() {
    let config = parse(&[
        "streamrelay",
        "--source",
        "http://a",
        "--logo",
        "http://cdn/x.png",
        "--logo-dir",
        "/srv/logos",
    ]);
    assert_eq!(config.stream_info().logo.as_deref(), Some("http://cdn/x.png"));
    assert_eq!(config.logo_dir, std::path::Path::new("/srv/logos"));

    let without = parse(&["streamrelay", "--source", "http://a"]);
    assert_eq!(without.stream_info().logo, None);
    assert_eq!(without.logo_dir, std::path::Path::new("logos"));
}
