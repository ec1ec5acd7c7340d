//! Fetch scheduling.
//!
//! [`due_tasks`] is a pure function of the registry, the current instant and
//! the [`FetchLog`]. The log itself is a small JSON file mapping
//! `source/channel` to the UTC instant of the last successful fetch.

use crate::config::Registry;
use crate::error::StorageError;
use crate::models::{ChannelKey, FetchTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, instrument};

/// Last successful fetch per channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FetchLog {
    entries: BTreeMap<ChannelKey, DateTime<Utc>>,
}

impl FetchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_fetch(&self, key: &ChannelKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    pub fn record(&mut self, key: ChannelKey, at: DateTime<Utc>) {
        self.entries.insert(key, at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the log from `path`. A missing file is an empty log.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No fetch state yet");
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(StorageError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text).map_err(|source| StorageError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the log to `path`, replacing the previous file atomically.
    #[instrument(level = "debug", skip_all, fields(path = %path.display(), entries = self.len()))]
    pub async fn save(&self, path: &Path) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(self)?;
        crate::utils::write_atomic(path, json.as_bytes()).await
    }
}

/// Channels due for a refresh at `now`, ordered by source id then channel.
///
/// A channel is due when it has never been fetched, or when at least
/// `lookback_hours` have passed since its last fetch. Both instants are
/// converted to the configured timezone before comparison, and the returned
/// `due_at` is expressed in that timezone.
pub fn due_tasks(registry: &Registry, now: DateTime<Utc>, log: &FetchLog) -> Vec<FetchTask> {
    let tz = registry.settings.timezone;
    let lookback = registry.settings.lookback();
    let now_local = now.with_timezone(&tz);

    let mut tasks: Vec<FetchTask> = registry
        .channels()
        .filter_map(|(source, channel)| {
            let key = ChannelKey::new(&source.id, &channel.name);
            let due_at = match log.last_fetch(&key) {
                None => now_local,
                Some(last) => last.with_timezone(&tz) + lookback,
            };
            if due_at <= now_local {
                Some(FetchTask { key, due_at })
            } else {
                debug!(channel = %key, %due_at, "Not due yet");
                None
            }
        })
        .collect();

    tasks.sort_by(|a, b| a.key.cmp(&b.key));
    tasks
}

/// Every active channel, as if none had ever been fetched.
pub fn all_tasks(registry: &Registry, now: DateTime<Utc>) -> Vec<FetchTask> {
    due_tasks(registry, now, &FetchLog::new())
}
