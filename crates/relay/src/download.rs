// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded downloader for auxiliary assets (channel logos, artwork).
//!
//! Concurrency is capped by a semaphore. A 429 from the remote locks every
//! download out for a cooldown window so the provider is not hammered.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

/// Attempts per download: the first try plus one retry.
const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_concurrent: usize,
    /// Lockout after the remote answers 429.
    pub cooldown: Duration,
    /// Bodies shorter than this are treated as failures.
    pub min_bytes: u64,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            cooldown: Duration::from_secs(3600),
            min_bytes: 2000,
            user_agent: concat!("streamrelay/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    /// The destination was already present; nothing was fetched.
    AlreadyExists,
    /// Downloads are in their 429 cooldown window.
    LockedOut,
    Failed { status: Option<u16>, reason: String },
}

/// Cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub total_download_attempts: u64,
    pub total_successful: u64,
    pub total_already_exists: u64,
    pub total_errors: u64,
    pub locked_out: bool,
}

enum Attempt {
    Done(u64),
    Status(StatusCode),
}

pub struct Downloader {
    client: reqwest::Client,
    config: DownloadConfig,
    permits: Arc<Semaphore>,
    locked_until: Mutex<Option<Instant>>,
    attempts: AtomicU64,
    successful: AtomicU64,
    already_exists: AtomicU64,
    errors: AtomicU64,
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("building download client")?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            locked_until: Mutex::new(None),
            attempts: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            already_exists: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Fetch `url` into `dest` unless it already exists or downloads are locked out.
    pub async fn download(&self, url: &str, dest: &Path) -> anyhow::Result<DownloadOutcome> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            self.already_exists.fetch_add(1, Ordering::Relaxed);
            return Ok(DownloadOutcome::AlreadyExists);
        }
        if self.is_locked_out() {
            tracing::debug!(url, "download skipped during cooldown");
            return Ok(DownloadOutcome::LockedOut);
        }

        let _permit = self.permits.acquire().await.context("download semaphore closed")?;
        let mut last_status = None;
        let mut last_reason = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            // A 429 may have arrived while this download queued for a permit.
            if self.is_locked_out() {
                tracing::debug!(url, attempt, "download skipped during cooldown");
                return Ok(DownloadOutcome::LockedOut);
            }
            match self.fetch(url, dest).await {
                Ok(Attempt::Done(bytes)) if bytes < self.config.min_bytes => {
                    let _ = tokio::fs::remove_file(dest).await;
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(url, bytes, min = self.config.min_bytes, "download too short");
                    return Ok(DownloadOutcome::Failed {
                        status: Some(StatusCode::OK.as_u16()),
                        reason: format!("body of {bytes} bytes is below {}", self.config.min_bytes),
                    });
                }
                Ok(Attempt::Done(bytes)) => {
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(url, dest = %dest.display(), bytes, "downloaded");
                    return Ok(DownloadOutcome::Downloaded { bytes });
                }
                Ok(Attempt::Status(status)) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        *self.locked_until.lock() = Some(Instant::now() + self.config.cooldown);
                        tracing::error!(
                            url,
                            cooldown_secs = self.config.cooldown.as_secs(),
                            "downloads locked out, too many requests"
                        );
                        return Ok(DownloadOutcome::LockedOut);
                    }
                    if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
                        return Ok(DownloadOutcome::Failed {
                            status: Some(status.as_u16()),
                            reason: status.to_string(),
                        });
                    }
                    tracing::warn!(url, %status, attempt, "download failed");
                    last_status = Some(status.as_u16());
                    last_reason = status.to_string();
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    let _ = tokio::fs::remove_file(dest).await;
                    tracing::warn!(url, err = %format!("{e:#}"), attempt, "download failed");
                    last_status = None;
                    last_reason = format!("{e:#}");
                }
            }
        }

        Ok(DownloadOutcome::Failed { status: last_status, reason: last_reason })
    }

    async fn fetch(&self, url: &str, dest: &Path) -> anyhow::Result<Attempt> {
        let resp = self.client.get(url).send().await.with_context(|| format!("requesting {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            return Ok(Attempt::Status(status));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        let mut body = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("reading download body")?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(Attempt::Done(written))
    }

    /// Destination for `url` inside `dir`, named after the last path segment.
    pub fn destination(dir: &Path, url: &str) -> PathBuf {
        dir.join(file_name_for(url))
    }

    pub fn is_locked_out(&self) -> bool {
        let mut locked = self.locked_until.lock();
        match *locked {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *locked = None;
                false
            }
            None => false,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus {
            total_download_attempts: self.attempts.load(Ordering::Relaxed),
            total_successful: self.successful.load(Ordering::Relaxed),
            total_already_exists: self.already_exists.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            locked_out: self.is_locked_out(),
        }
    }
}

/// File name for a downloaded asset: the URL's last path segment without
/// query or fragment, reduced to filesystem-safe characters.
pub fn file_name_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let segment = match path.split_once('/') {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or_default(),
        None => "",
    };
    let name: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if name.trim_matches('.').is_empty() {
        "logo".to_owned()
    } else {
        name
    }
}

#[cfg(test)]
#[path = "download_tests.rs"]
mod tests;
