//! Data models shared across the ingestion pipeline.
//!
//! - [`ChannelKey`]: identity of one RSS channel (`source/channel`)
//! - [`RawItem`]: one feed entry as persisted in the raw store
//! - [`FetchTask`]: a channel the scheduler decided to refresh
//! - [`TaskState`] / [`TaskReport`]: per-task lifecycle and outcome
//! - [`RunResult`]: the aggregate summary of one coordinator run

use crate::error::IngestError;
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::path::PathBuf;

/// Identity of one channel inside one source.
///
/// Ordering is by source id, then channel name, which is the order the
/// scheduler emits tasks in. The textual form is `source/channel`, e.g.
/// `lenta.ru/world`, and that is also how it is serialized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    pub source: String,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(source: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channel: channel.into(),
        }
    }

    /// Parse the `source/channel` form. Source ids are domain names, so the
    /// first `/` separates the two parts.
    pub fn parse(s: &str) -> Option<Self> {
        let (source, channel) = s.split_once('/')?;
        if source.is_empty() || channel.is_empty() {
            return None;
        }
        Some(Self::new(source, channel))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.channel)
    }
}

impl Serialize for ChannelKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChannelKey::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("expected `source/channel`, got `{s}`")))
    }
}

/// An unprocessed feed entry, exactly as written to the raw store.
///
/// Items are created by the fetcher, filtered by the coordinator, and written
/// once by the raw store. Nothing in this crate mutates or deletes them after
/// that; downstream enrichment reads them from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Short identifier derived from the link (numeric id or last path segment).
    pub news_id: String,
    /// Entry headline.
    pub title: String,
    /// Canonical link. This is the deduplication key.
    pub link: String,
    /// Publication time in the configured timezone, if the feed provides one.
    pub published_at: Option<DateTime<FixedOffset>>,
    /// Source id, e.g. `ria.ru`.
    pub source: String,
    /// Channel name inside the source, e.g. `politics`.
    pub channel: String,
    /// Category label configured for the channel.
    pub category: String,
    /// Entry summary/description from the feed.
    pub summary: Option<String>,
    /// Entry body, or article text when article extraction is configured.
    #[serde(default)]
    pub raw_content: String,
    /// When this item was retrieved, in the configured timezone.
    pub fetched_at: DateTime<FixedOffset>,
}

/// A channel due for refresh in the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub key: ChannelKey,
    /// The instant the channel became due, in the configured timezone.
    pub due_at: DateTime<Tz>,
}

/// Lifecycle of a single fetch task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Fetching,
    Fetched,
    FetchFailed,
    Persisted,
    PersistFailed,
    Done,
}

impl TaskState {
    /// Whether `self -> next` is an edge of the task state machine.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Fetched)
                | (Fetching, FetchFailed)
                | (Fetched, Persisted)
                | (Fetched, PersistFailed)
                | (FetchFailed, Done)
                | (Persisted, Done)
                | (PersistFailed, Done)
        )
    }
}

/// Which component a run error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Parse,
    Storage,
}

/// A recoverable failure recorded in the run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// `source/channel` for task errors, or a path/name for run-level errors.
    pub scope: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn from_ingest(key: &ChannelKey, err: &IngestError) -> Self {
        let kind = match err {
            IngestError::Fetch(_) => ErrorKind::Fetch,
            IngestError::Parse(_) => ErrorKind::Parse,
            IngestError::Storage(_) => ErrorKind::Storage,
        };
        Self {
            scope: key.to_string(),
            kind,
            message: err.to_string(),
        }
    }
}

/// Outcome of one fetch task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub key: ChannelKey,
    /// Every state the task went through, starting at `Pending`.
    pub trail: Vec<TaskState>,
    pub fetched: usize,
    pub skipped_stale: usize,
    pub written: usize,
    pub skipped_duplicate: usize,
    pub file: Option<PathBuf>,
    pub error: Option<RunError>,
}

impl TaskReport {
    pub fn new(key: ChannelKey) -> Self {
        Self {
            key,
            trail: vec![TaskState::Pending],
            fetched: 0,
            skipped_stale: 0,
            written: 0,
            skipped_duplicate: 0,
            file: None,
            error: None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.trail.last().copied().unwrap_or(TaskState::Pending)
    }

    /// Move to `next`. Illegal edges are a programming error.
    pub fn advance(&mut self, next: TaskState) {
        debug_assert!(
            self.state().can_advance_to(next),
            "illegal task transition {:?} -> {:?}",
            self.state(),
            next
        );
        self.trail.push(next);
    }

    pub fn fail(&mut self, next: TaskState, err: &IngestError) {
        self.advance(next);
        self.error = Some(RunError::from_ingest(&self.key, err));
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-source totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub fetched: usize,
    pub written: usize,
    pub skipped_duplicate: usize,
    pub skipped_stale: usize,
    pub succeeded_channels: usize,
    pub failed_channels: usize,
    pub files: Vec<PathBuf>,
}

/// Aggregate result of one coordinator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sources: BTreeMap<String, SourceSummary>,
    pub tasks: Vec<TaskReport>,
    pub errors: Vec<RunError>,
    /// Due tasks that were never started because the run was cancelled.
    pub cancelled: usize,
}

impl RunResult {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            sources: BTreeMap::new(),
            tasks: Vec::new(),
            errors: Vec::new(),
            cancelled: 0,
        }
    }

    /// Fold a finished task into the per-source totals and the error list.
    pub fn record(&mut self, report: TaskReport) {
        let summary = self.sources.entry(report.key.source.clone()).or_default();
        summary.fetched += report.fetched;
        summary.written += report.written;
        summary.skipped_duplicate += report.skipped_duplicate;
        summary.skipped_stale += report.skipped_stale;
        if let Some(file) = &report.file {
            if !summary.files.contains(file) {
                summary.files.push(file.clone());
            }
        }
        match &report.error {
            None => summary.succeeded_channels += 1,
            Some(err) => {
                summary.failed_channels += 1;
                self.errors.push(err.clone());
            }
        }
        self.tasks.push(report);
    }

    pub fn total_written(&self) -> usize {
        self.sources.values().map(|s| s.written).sum()
    }

    /// True when work was attempted and no source got a single channel through.
    pub fn all_sources_failed(&self) -> bool {
        !self.sources.is_empty() && self.sources.values().all(|s| s.succeeded_channels == 0)
    }

    /// Human-readable summary, one line per source followed by the errors.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Run started {} ({} task(s), {} cancelled)",
            self.started_at.to_rfc3339(),
            self.tasks.len(),
            self.cancelled
        );
        if self.sources.is_empty() {
            let _ = writeln!(out, "  nothing was due");
        }
        for (source, s) in &self.sources {
            let status = if s.succeeded_channels == 0 { "FAILED" } else { "OK" };
            let _ = writeln!(
                out,
                "  [{status}] {source}: fetched {}, written {}, duplicates {}, stale {}, channels ok {}/{}",
                s.fetched,
                s.written,
                s.skipped_duplicate,
                s.skipped_stale,
                s.succeeded_channels,
                s.succeeded_channels + s.failed_channels
            );
            for file in &s.files {
                let _ = writeln!(out, "      -> {}", file.display());
            }
        }
        if !self.errors.is_empty() {
            let _ = writeln!(out, "Errors:");
            for e in &self.errors {
                let _ = writeln!(out, "  {} ({:?}): {}", e.scope, e.kind, e.message);
            }
        }
        out
    }
}
