// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::download::DownloadConfig;
use crate::session::{SessionConfig, StreamInfo, StreamSource};

/// Default decoder arguments: remux the source to MPEG-TS on stdout.
pub const DEFAULT_FFMPEG_OPTIONS: &str =
    "-hide_banner -loglevel error -i {streamUrl} -map 0 -c copy -f mpegts pipe:1";

/// How the relay pulls bytes from each source.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    #[default]
    Http,
    Ffmpeg,
}

impl std::fmt::Display for IngestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Ffmpeg => f.write_str("ffmpeg"),
        }
    }
}

impl std::str::FromStr for IngestKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => anyhow::bail!("invalid ingest mode: {other}"),
        }
    }
}

/// Live-stream relay: one upstream, many downstream readers.
#[derive(Debug, Parser)]
#[command(name = "streamrelay", version, about)]
pub struct Config {
    /// Upstream URL; repeat for failover candidates, tried in order.
    #[arg(long = "source", env = "STREAMRELAY_SOURCES", value_delimiter = ',')]
    pub sources: Vec<String>,

    /// Ingest mode (http or ffmpeg).
    #[arg(long, env = "STREAMRELAY_INGEST", default_value = "http")]
    pub ingest: String,

    /// Decoder binary for ffmpeg ingest.
    #[arg(long, env = "STREAMRELAY_FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg_path: String,

    /// Decoder arguments; `{streamUrl}` is replaced with the source URL.
    #[arg(long, env = "STREAMRELAY_FFMPEG_OPTIONS", default_value = DEFAULT_FFMPEG_OPTIONS)]
    pub ffmpeg_options: String,

    /// User-Agent sent to HTTP upstreams.
    #[arg(long, env = "STREAMRELAY_USER_AGENT", default_value = "streamrelay")]
    pub user_agent: String,

    /// Channel id reported in statistics.
    #[arg(long, env = "STREAMRELAY_CHANNEL_ID", default_value = "")]
    pub channel_id: String,

    /// Channel name reported in statistics.
    #[arg(long, env = "STREAMRELAY_CHANNEL_NAME", default_value = "")]
    pub channel_name: String,

    /// Channel logo URL, fetched once into `--logo-dir`.
    #[arg(long, env = "STREAMRELAY_LOGO")]
    pub logo: Option<String>,

    /// Directory downloaded logos are stored in.
    #[arg(long, env = "STREAMRELAY_LOGO_DIR", default_value = "logos")]
    pub logo_dir: PathBuf,

    /// Initial ring buffer size in bytes.
    #[arg(long, env = "STREAMRELAY_BUFFER_SIZE", default_value = "4194304")]
    pub buffer_size: usize,

    /// Maximum buffer size as a multiple of the initial size.
    #[arg(long, env = "STREAMRELAY_MAX_GROWTH_FACTOR", default_value = "4")]
    pub max_growth_factor: usize,

    /// Maximum clients per session.
    #[arg(long, env = "STREAMRELAY_MAX_STREAMS", default_value = "10")]
    pub max_streams: usize,

    /// Largest chunk handed to a client per read.
    #[arg(long, env = "STREAMRELAY_READ_CHUNK_SIZE", default_value = "65536")]
    pub read_chunk_size: usize,

    /// Buffer health check period in ms.
    #[arg(long, env = "STREAMRELAY_HEALTH_CHECK_MS", default_value = "5000")]
    pub health_check_ms: u64,

    /// Overwrite events per health period that grow the buffer.
    #[arg(long, env = "STREAMRELAY_DROP_THRESHOLD", default_value = "3")]
    pub drop_threshold: u64,

    /// Statistics log period in ms (0 = disabled).
    #[arg(long, env = "STREAMRELAY_STATS_INTERVAL_MS", default_value = "10000")]
    pub stats_interval_ms: u64,

    /// Where the relayed stream is written (`-` for stdout).
    #[arg(long, env = "STREAMRELAY_OUTPUT", default_value = "-")]
    pub output: String,

    /// Concurrent auxiliary downloads.
    #[arg(long, env = "STREAMRELAY_MAX_CONCURRENT_DOWNLOADS", default_value = "8")]
    pub max_concurrent_downloads: usize,

    /// Download lockout after a 429, in seconds.
    #[arg(long, env = "STREAMRELAY_DOWNLOAD_COOLDOWN_SECS", default_value = "3600")]
    pub download_cooldown_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "STREAMRELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "STREAMRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // -- Duration overrides (skip from CLI; set in Config::test()) --------
    #[clap(skip)]
    pub restart_delay_ms: Option<u64>,
    #[clap(skip)]
    pub reap_poll_ms: Option<u64>,
}

fn env_duration_ms(var: &str, default: u64) -> Duration {
    let ms = std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default);
    Duration::from_millis(ms)
}

macro_rules! duration_field {
    ($method:ident, $field:ident, $env:literal, $default:expr) => {
        pub fn $method(&self) -> Duration {
            match self.$field {
                Some(ms) => Duration::from_millis(ms),
                None => env_duration_ms($env, $default),
            }
        }
    };
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sources.iter().all(|s| s.trim().is_empty()) {
            anyhow::bail!("at least one --source must be specified");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("--buffer-size must be greater than zero");
        }
        if self.max_growth_factor == 0 {
            anyhow::bail!("--max-growth-factor must be at least 1");
        }
        if self.max_streams == 0 {
            anyhow::bail!("--max-streams must be greater than zero");
        }
        if self.read_chunk_size == 0 {
            anyhow::bail!("--read-chunk-size must be greater than zero");
        }
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("--max-concurrent-downloads must be greater than zero");
        }
        if self.health_check_ms == 0 {
            anyhow::bail!("--health-check-ms must be greater than zero");
        }

        let ingest = self.ingest_kind()?;
        if ingest == IngestKind::Ffmpeg && self.ffmpeg_path.trim().is_empty() {
            anyhow::bail!("--ffmpeg-path is required for ffmpeg ingest");
        }

        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }

        Ok(())
    }

    pub fn ingest_kind(&self) -> anyhow::Result<IngestKind> {
        self.ingest.parse()
    }

    // -- Tuning knobs (field override → env var → compiled default) --------

    duration_field!(restart_delay, restart_delay_ms, "STREAMRELAY_RESTART_DELAY_MS", 500);
    duration_field!(reap_poll, reap_poll_ms, "STREAMRELAY_REAP_POLL_MS", 5_000);

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }

    /// `None` when periodic statistics logging is disabled.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_ms > 0).then(|| Duration::from_millis(self.stats_interval_ms))
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_buffer_size(self.buffer_size)
            .with_growth_factor(self.max_growth_factor)
            .with_max_streams(self.max_streams)
            .with_read_chunk_size(self.read_chunk_size)
            .with_health_check_interval(self.health_check_interval())
            .with_drop_threshold(self.drop_threshold)
            .with_restart_delay(self.restart_delay())
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_concurrent: self.max_concurrent_downloads,
            cooldown: Duration::from_secs(self.download_cooldown_secs),
            user_agent: self.user_agent.clone(),
            ..DownloadConfig::default()
        }
    }

    /// Candidate sources in failover order.
    pub fn stream_sources(&self) -> anyhow::Result<Vec<StreamSource>> {
        let ingest = self.ingest_kind()?;
        let args: Vec<String> =
            self.ffmpeg_options.split_whitespace().map(str::to_owned).collect();
        Ok(self
            .sources
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|url| match ingest {
                IngestKind::Http => StreamSource::http(url),
                IngestKind::Ffmpeg => StreamSource::process(url, &self.ffmpeg_path, args.clone()),
            })
            .collect())
    }

    /// Descriptor for the relayed channel, keyed by the first source.
    pub fn stream_info(&self) -> StreamInfo {
        let url = self.sources.iter().map(|s| s.trim()).find(|s| !s.is_empty()).unwrap_or("");
        let info = StreamInfo::new(url).with_channel(&self.channel_id, &self.channel_name);
        match self.logo.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
            Some(logo) => info.with_logo(logo),
            None => info,
        }
    }

    /// Output path, or `None` for stdout.
    pub fn output_path(&self) -> Option<PathBuf> {
        (self.output != "-").then(|| PathBuf::from(&self.output))
    }

    /// Build a minimal `Config` for tests.
    #[doc(hidden)]
    pub fn test() -> Self {
        Self {
            sources: vec!["http://127.0.0.1:1/live.ts".into()],
            ingest: "http".into(),
            ffmpeg_path: "ffmpeg".into(),
            ffmpeg_options: DEFAULT_FFMPEG_OPTIONS.into(),
            user_agent: "streamrelay-test".into(),
            channel_id: String::new(),
            channel_name: String::new(),
            logo: None,
            logo_dir: PathBuf::from("logos"),
            buffer_size: 4096,
            max_growth_factor: 4,
            max_streams: 10,
            read_chunk_size: 1024,
            health_check_ms: 1000,
            drop_threshold: 3,
            stats_interval_ms: 0,
            output: "-".into(),
            max_concurrent_downloads: 2,
            download_cooldown_secs: 60,
            log_format: "text".into(),
            log_level: "debug".into(),
            restart_delay_ms: Some(10),
            reap_poll_ms: Some(10),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
