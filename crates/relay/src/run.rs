// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level relay runner, shared by `main` and integration tests.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::Config;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::RelayError;
use crate::manager::{RelayManager, StartRequest};
use crate::session::{ClientMeta, DefaultUpstreams, ReadOutcome, UpstreamFactory};

/// Totals reported when the relay finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub bytes_relayed: u64,
    /// Bytes the local reader lost to overwrites.
    pub bytes_skipped: u64,
}

/// Initialize tracing/logging from config.
///
/// Logs go to stderr so stdout can carry the stream. Uses `try_init` so it's
/// safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Relay the configured sources to the configured output until `shutdown`
/// fires or every source is exhausted.
pub async fn run(config: Config, shutdown: CancellationToken) -> anyhow::Result<RunSummary> {
    let factory: Arc<dyn UpstreamFactory> = Arc::new(DefaultUpstreams::new(&config.user_agent)?);
    run_with_factory(config, factory, shutdown).await
}

/// [`run`] with an injected upstream factory.
pub async fn run_with_factory(
    config: Config,
    factory: Arc<dyn UpstreamFactory>,
    shutdown: CancellationToken,
) -> anyhow::Result<RunSummary> {
    let mut output = open_output(&config).await?;
    let manager = Arc::new(RelayManager::new(config.session_config(), factory));
    let reaper = manager.spawn_reaper(config.reap_poll(), shutdown.child_token());

    let info = config.stream_info();
    let logo_task = match &info.logo {
        Some(logo) => Some(spawn_logo_download(&config, logo.clone())?),
        None => None,
    };

    let request = StartRequest::new(info, config.stream_sources()?);
    let handle = manager.start_session(request)?;
    let client = ClientMeta::new(Uuid::new_v4(), "streamrelay", "local");
    let mut reader = manager.attach_client(handle, client)?;
    info!(session = %handle, output = %config.output, "relay started");

    if let Some(period) = config.stats_interval() {
        let manager = Arc::clone(&manager);
        let stop = shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match serde_json::to_string(&manager.all_statistics()) {
                            Ok(json) => info!(statistics = %json, "stream statistics"),
                            Err(e) => warn!(err = %e, "statistics serialization failed"),
                        }
                    }
                }
            }
        });
    }

    let mut summary = RunSummary::default();
    let result = loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            outcome = reader.next() => outcome,
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => break Err(e.into()),
        };
        let data = match outcome {
            ReadOutcome::Data(data) => data,
            ReadOutcome::Overwritten { data, skipped } => {
                warn!(session = %handle, skipped, "output fell behind, bytes skipped");
                summary.bytes_skipped += skipped;
                data
            }
            ReadOutcome::WouldBlock => continue,
            ReadOutcome::Closed => break Err(anyhow::Error::new(RelayError::SourcesExhausted)),
        };
        if let Err(e) = output.write_all(&data).await {
            break Err(anyhow::Error::new(e).context("writing output"));
        }
        summary.bytes_relayed += data.len() as u64;
    };

    let _ = output.flush().await;
    reader.detach();
    manager.stop_all();
    if let Some(task) = logo_task {
        task.abort();
    }
    shutdown.cancel();
    let _ = reaper.await;
    info!(
        bytes_relayed = summary.bytes_relayed,
        bytes_skipped = summary.bytes_skipped,
        "relay finished"
    );
    result.map(|()| summary)
}

/// Fetch the channel logo into the logo directory in the background.
fn spawn_logo_download(
    config: &Config,
    url: String,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let downloader = Downloader::new(config.download_config())?;
    let dir = config.logo_dir.clone();
    Ok(tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), err = %e, "cannot create logo directory");
            return;
        }
        let dest = Downloader::destination(&dir, &url);
        match downloader.download(&url, &dest).await {
            Ok(DownloadOutcome::Downloaded { bytes }) => {
                info!(url = %url, dest = %dest.display(), bytes, "logo downloaded");
            }
            Ok(DownloadOutcome::Failed { status, reason }) => {
                warn!(url = %url, ?status, reason = %reason, "logo download failed");
            }
            Ok(outcome) => info!(url = %url, ?outcome, "logo not downloaded"),
            Err(e) => warn!(url = %url, err = %format!("{e:#}"), "logo download failed"),
        }
    }))
}

async fn open_output(config: &Config) -> anyhow::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    match config.output_path() {
        Some(path) => {
            let file = tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("creating output {}", path.display()))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}
