// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: scripted upstreams and assertion helpers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::{StreamSource, Upstream, UpstreamFactory};

/// How a scripted upstream finishes after emitting its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnd {
    /// Return `Ok(())`, as a source whose stream ended.
    Eof,
    /// Return an error with this message.
    Fail(String),
    /// Stay connected until cancelled.
    Hold,
}

/// Chunks an upstream emits, in order, and how it ends.
#[derive(Debug, Clone)]
pub struct UpstreamScript {
    pub chunks: Vec<Bytes>,
    pub chunk_delay: Duration,
    pub end: ScriptEnd,
}

impl UpstreamScript {
    pub fn new(chunks: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            chunk_delay: Duration::ZERO,
            end: ScriptEnd::Hold,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn ending(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// A source that fails before emitting anything.
    pub fn failing(reason: &str) -> Self {
        Self::new(Vec::<Bytes>::new()).ending(ScriptEnd::Fail(reason.to_owned()))
    }
}

/// In-memory [`Upstream`] driven by an [`UpstreamScript`].
pub struct ScriptedUpstream {
    script: UpstreamScript,
}

impl ScriptedUpstream {
    pub fn new(script: UpstreamScript) -> Self {
        Self { script }
    }
}

impl Upstream for ScriptedUpstream {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let chunks = std::mem::take(&mut self.script.chunks);
        let delay = self.script.chunk_delay;
        let end = self.script.end.clone();

        Box::pin(async move {
            for chunk in chunks {
                if output_tx.send(chunk).await.is_err() {
                    return Ok(());
                }
                if delay > Duration::ZERO {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            match end {
                ScriptEnd::Eof => Ok(()),
                ScriptEnd::Fail(reason) => anyhow::bail!(reason),
                ScriptEnd::Hold => {
                    cancel.cancelled().await;
                    Ok(())
                }
            }
        })
    }
}

/// [`UpstreamFactory`] returning scripted upstreams by URL.
///
/// Opening a URL without a script fails. Every open is recorded.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, UpstreamScript>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, url: &str, script: UpstreamScript) -> Self {
        self.scripts.lock().insert(url.to_owned(), script);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// URLs opened so far, in order.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl UpstreamFactory for ScriptedFactory {
    fn open(&self, source: &StreamSource) -> anyhow::Result<Box<dyn Upstream>> {
        self.opened.lock().push(source.url.clone());
        let script = self.scripts.lock().get(&source.url).cloned();
        match script {
            Some(script) => Ok(Box::new(ScriptedUpstream::new(script))),
            None => anyhow::bail!("no script for {}", source.url),
        }
    }
}

/// Assert that `$expr` is `Err` and its message contains `$substr`.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
