// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream descriptors and failover candidate ordering.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Descriptive metadata for the channel a session streams.
///
/// Supplied by the playlist layer and copied into every statistics row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub stream_url: String,
    pub channel_id: String,
    pub channel_name: String,
    pub video_stream_id: String,
    pub video_stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default)]
    pub rank: u32,
}

impl StreamInfo {
    pub fn new(stream_url: impl Into<String>) -> Self {
        Self { stream_url: stream_url.into(), ..Default::default() }
    }

    pub fn with_channel(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.channel_id = id.into();
        self.channel_name = name.into();
        self
    }

    pub fn with_video_stream(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.video_stream_id = id.into();
        self.video_stream_name = name.into();
        self
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }
}

/// How bytes are pulled from a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IngestMode {
    /// Streaming HTTP GET.
    Http,
    /// External decoder writing the stream to stdout. `{streamUrl}` in
    /// `args` is replaced with the source URL.
    Process { program: String, args: Vec<String> },
}

/// One candidate upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    pub url: String,
    pub ingest: IngestMode,
}

impl StreamSource {
    pub fn http(url: impl Into<String>) -> Self {
        Self { url: url.into(), ingest: IngestMode::Http }
    }

    pub fn process(url: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self { url: url.into(), ingest: IngestMode::Process { program: program.into(), args } }
    }
}

/// Supplies the next source to try when a session starts or fails over.
pub trait SourceResolver: Send + 'static {
    /// Return the next candidate, or `None` once every candidate is spent.
    fn next_source(&mut self) -> Option<StreamSource>;
}

/// Walks an ordered candidate list once.
#[derive(Debug, Clone, Default)]
pub struct FailoverList {
    sources: VecDeque<StreamSource>,
}

impl FailoverList {
    pub fn new(sources: impl IntoIterator<Item = StreamSource>) -> Self {
        Self { sources: sources.into_iter().collect() }
    }

    pub fn remaining(&self) -> usize {
        self.sources.len()
    }
}

impl SourceResolver for FailoverList {
    fn next_source(&mut self) -> Option<StreamSource> {
        self.sources.pop_front()
    }
}
