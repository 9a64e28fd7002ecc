// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream producers: HTTP pull and external decoder processes.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::source::{IngestMode, StreamSource};
use crate::error::RelayError;

/// Read size for decoder stdout.
const PROCESS_READ_SIZE: usize = 64 * 1024;

/// How often an exiting decoder is polled for its status.
const EXIT_POLL: Duration = Duration::from_millis(20);

/// Placeholder replaced with the source URL in process arguments.
pub const STREAM_URL_PLACEHOLDER: &str = "{streamUrl}";

/// A running source of stream bytes.
///
/// Object-safe for use as `Box<dyn Upstream>`. `run` returns `Ok(())` when
/// cancelled or when the source ends, and `Err` when it fails.
pub trait Upstream: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Kill handle when the upstream is an external process.
    fn process(&self) -> Option<ProcessHandle> {
        None
    }
}

/// Shared view of a spawned process used to kill it by pid.
///
/// The pid is only signalled while the process is unreaped and still owned
/// by its upstream; both the reap and the kill happen under `live`.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    live: Arc<Mutex<bool>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the pid still names our child.
    pub fn is_live(&self) -> bool {
        *self.live.lock()
    }

    /// SIGKILL the process if it is still ours. Returns whether a signal was sent.
    pub fn terminate(&self) -> Result<bool, RelayError> {
        let live = self.live.lock();
        if !*live {
            return Ok(false);
        }
        terminate_process(self.pid)?;
        Ok(true)
    }
}

/// Turns a [`StreamSource`] into a ready-to-run [`Upstream`].
pub trait UpstreamFactory: Send + Sync + 'static {
    fn open(&self, source: &StreamSource) -> anyhow::Result<Box<dyn Upstream>>;
}

/// Production factory: reqwest for HTTP sources, `tokio::process` for decoders.
pub struct DefaultUpstreams {
    client: reqwest::Client,
    user_agent: String,
}

impl DefaultUpstreams {
    pub fn new(user_agent: impl Into<String>) -> anyhow::Result<Self> {
        // No overall timeout: the response body is the live stream.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building upstream client")?;
        Ok(Self { client, user_agent: user_agent.into() })
    }
}

impl UpstreamFactory for DefaultUpstreams {
    fn open(&self, source: &StreamSource) -> anyhow::Result<Box<dyn Upstream>> {
        match &source.ingest {
            IngestMode::Http => Ok(Box::new(HttpUpstream::new(
                self.client.clone(),
                source.url.clone(),
                self.user_agent.clone(),
            ))),
            IngestMode::Process { program, args } => {
                Ok(Box::new(ProcessUpstream::spawn(program, args, &source.url)?))
            }
        }
    }
}

/// Streaming HTTP GET.
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
    user_agent: String,
}

impl HttpUpstream {
    pub fn new(client: reqwest::Client, url: String, user_agent: String) -> Self {
        Self { client, url, user_agent }
    }
}

impl Upstream for HttpUpstream {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let request = self
                .client
                .get(&self.url)
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .send();
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                resp = request => resp.with_context(|| format!("connecting to {}", self.url))?,
            };

            let status = resp.status();
            if !status.is_success() {
                let reason = format!("{} returned {status}", self.url);
                return Err(RelayError::UpstreamFailure(reason).into());
            }

            let mut body = resp.bytes_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    chunk = body.next() => match chunk {
                        Some(Ok(data)) => {
                            if output_tx.send(data).await.is_err() {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e).context("reading upstream body"),
                        None => return Ok(()),
                    },
                }
            }
        })
    }
}

/// External decoder (typically ffmpeg) whose stdout is the stream.
pub struct ProcessUpstream {
    child: Child,
    pid: Option<u32>,
    live: Arc<Mutex<bool>>,
    program: String,
}

impl ProcessUpstream {
    /// Spawn `program` with `{streamUrl}` in `args` replaced by `url`.
    pub fn spawn(program: &str, args: &[String], url: &str) -> anyhow::Result<Self> {
        let args = substitute_url(args, url);

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {program}"))?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            let program = program.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(program = %program, pid = ?pid, "{line}");
                }
            });
        }

        tracing::info!(program = %program, pid = ?pid, "spawned upstream process");
        Ok(Self { child, pid, live: Arc::new(Mutex::new(true)), program: program.to_owned() })
    }

    /// Reap the child if it has exited, marking its pid as no longer ours.
    fn try_reap(&mut self) -> anyhow::Result<Option<std::process::ExitStatus>> {
        let mut live = self.live.lock();
        let status = self.child.try_wait().context("polling process exit")?;
        if status.is_some() {
            *live = false;
        }
        Ok(status)
    }
}

impl Drop for ProcessUpstream {
    fn drop(&mut self) {
        // The owned child is killed on drop and reaped by the runtime, after
        // which its pid may be reused.
        *self.live.lock() = false;
    }
}

impl Upstream for ProcessUpstream {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut stdout = self.child.stdout.take().context("process stdout not captured")?;
            let mut buf = BytesMut::with_capacity(PROCESS_READ_SIZE);

            loop {
                buf.reserve(PROCESS_READ_SIZE);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = self.child.start_kill();
                        return Ok(());
                    }
                    result = stdout.read_buf(&mut buf) => {
                        let n = result.context("reading process stdout")?;
                        if n == 0 {
                            break;
                        }
                        if output_tx.send(buf.split().freeze()).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            let status = loop {
                if let Some(status) = self.try_reap()? {
                    break status;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = self.child.start_kill();
                        return Ok(());
                    }
                    _ = tokio::time::sleep(EXIT_POLL) => {}
                }
            };
            if !status.success() {
                bail!("{} exited with {status}", self.program);
            }
            Ok(())
        })
    }

    fn process(&self) -> Option<ProcessHandle> {
        self.pid.map(|pid| ProcessHandle { pid, live: Arc::clone(&self.live) })
    }
}

/// Replace `{streamUrl}` in every argument.
pub fn substitute_url(args: &[String], url: &str) -> Vec<String> {
    args.iter().map(|a| a.replace(STREAM_URL_PLACEHOLDER, url)).collect()
}

/// Best-effort kill of a process by id.
///
/// A process that is already gone counts as terminated. Callers must know
/// the pid has not been reaped; [`ProcessHandle::terminate`] checks that.
pub fn terminate_process(pid: u32) -> Result<(), RelayError> {
    let raw = i32::try_from(pid).map_err(|_| RelayError::ProcessTerminationFailure {
        pid,
        reason: "pid out of range".to_owned(),
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(RelayError::ProcessTerminationFailure { pid, reason: e.to_string() }),
    }
}

/// Scoped ownership of one running producer.
///
/// Releasing (explicitly or on drop) kills its process, then cancels the
/// producer task. Kill failures are logged and swallowed so teardown always
/// completes.
pub struct ProducerGuard {
    source: StreamSource,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    process: Option<ProcessHandle>,
}

impl ProducerGuard {
    /// Spawn `upstream` on its own task under a child of `parent`.
    ///
    /// The returned receiver yields the producer's final result.
    pub fn spawn(
        mut upstream: Box<dyn Upstream>,
        source: StreamSource,
        parent: &CancellationToken,
        output_tx: mpsc::Sender<Bytes>,
    ) -> (Self, oneshot::Receiver<anyhow::Result<()>>) {
        let cancel = parent.child_token();
        let process = upstream.process();
        let (done_tx, done_rx) = oneshot::channel();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let result = upstream.run(output_tx, task_cancel).await;
            let _ = done_tx.send(result);
        });

        (Self { source, cancel, task: Some(task), process }, done_rx)
    }

    pub fn source(&self) -> &StreamSource {
        &self.source
    }

    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }

    /// Cancel the producer and kill its process.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        // Kill before cancelling: until the task sees cancellation the
        // upstream still owns the child, so the pid cannot be recycled.
        if let Some(process) = &self.process {
            match process.terminate() {
                Ok(true) => tracing::debug!(pid = process.pid(), "upstream process killed"),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        pid = process.pid(),
                        url = %self.source.url,
                        err = %e,
                        "upstream process kill failed"
                    );
                }
            }
        }
        self.cancel.cancel();
        task.abort();
        tracing::debug!(url = %self.source.url, "producer released");
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
