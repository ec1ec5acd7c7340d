//! Append-only raw store, deduplicated by link.
//!
//! # Layout
//!
//! ```text
//! raw_data_dir/
//! ├── ria_20250314_1200.json      # every new ria.ru item of the 12:00 run
//! ├── ria_20250315_0000.json
//! ├── lenta_20250314_1200.json
//! └── lenta_20250314_1200_1.json  # a later run within the same minute
//! ```
//!
//! Each file is a JSON array of [`RawItem`] in fetch order. Files from earlier
//! runs are never rewritten; within a run, later channels of the same source
//! extend that run's file.
//!
//! # Deduplication
//!
//! An item is a duplicate when its link already appears in any file of the
//! same source. The set of known links is read from disk the first time a
//! source is persisted and kept in memory afterwards. A per-source async
//! mutex serializes the check-then-write, so two channels of one source can
//! never both decide the same link is new; different sources do not contend.

use crate::config::Registry;
use crate::error::StorageError;
use crate::models::RawItem;
use crate::utils::{run_stamp, write_atomic};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Stamp part of a run file name, after `{raw_prefix}_` and before `.json`.
static RUN_FILE_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{8}_\d{4}(?:_\d+)?$").expect("static pattern"));

/// Result of one [`RawStore::persist`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub written: usize,
    pub skipped_duplicate: usize,
    /// The run file that received the items; `None` when nothing was new.
    pub path: Option<PathBuf>,
}

/// Only the dedup key is needed from stored records. Files written by the
/// earlier Python tool keyed it as `url`.
#[derive(Deserialize)]
struct StoredLink {
    #[serde(alias = "url")]
    link: String,
}

struct RunFile {
    run: u64,
    stamp: String,
    path: PathBuf,
    items: Vec<RawItem>,
}

#[derive(Default)]
struct Shard {
    seen: Option<HashSet<String>>,
    current: Option<RunFile>,
}

pub struct RawStore {
    root: PathBuf,
    timezone: Tz,
    prefixes: HashMap<String, String>,
    shards: StdMutex<HashMap<String, Arc<Mutex<Shard>>>>,
    run: AtomicU64,
}

impl RawStore {
    /// `prefixes` maps source id to raw file prefix.
    pub fn new(root: impl Into<PathBuf>, timezone: Tz, prefixes: HashMap<String, String>) -> Self {
        Self {
            root: root.into(),
            timezone,
            prefixes,
            shards: StdMutex::new(HashMap::new()),
            run: AtomicU64::new(0),
        }
    }

    pub fn from_registry(registry: &Registry) -> Self {
        Self::new(
            registry.settings.raw_data_dir.clone(),
            registry.settings.timezone,
            registry.prefixes(),
        )
    }

    /// Start a new run. Items persisted afterwards go to fresh run files,
    /// even when the run stamp equals that of the previous run.
    pub fn begin_run(&self) {
        self.run.fetch_add(1, Ordering::SeqCst);
    }

    fn shard(&self, source_id: &str) -> Arc<Mutex<Shard>> {
        let mut shards = self.shards.lock().unwrap_or_else(|e| e.into_inner());
        shards.entry(source_id.to_string()).or_default().clone()
    }

    /// Write the items of `source_id` whose links are not stored yet.
    ///
    /// `run_at` names the run file (`{raw_prefix}_{YYYYMMDD_HHMM}.json` in
    /// the configured timezone). Links repeated inside `items` count as
    /// duplicates after their first occurrence.
    #[instrument(level = "info", skip_all, fields(source = %source_id, items = items.len()))]
    pub async fn persist(
        &self,
        source_id: &str,
        items: &[RawItem],
        run_at: DateTime<Utc>,
    ) -> Result<PersistOutcome, StorageError> {
        let prefix = self
            .prefixes
            .get(source_id)
            .ok_or_else(|| StorageError::UnknownSource(source_id.to_string()))?;

        let shard = self.shard(source_id);
        let mut shard = shard.lock().await;
        self.ensure_seen(&mut shard, prefix).await?;
        let Shard { seen, current } = &mut *shard;
        let seen = seen.get_or_insert_with(HashSet::new);

        let mut batch: HashSet<&str> = HashSet::new();
        let mut fresh: Vec<RawItem> = Vec::new();
        for item in items {
            if !seen.contains(&item.link) && batch.insert(item.link.as_str()) {
                fresh.push(item.clone());
            }
        }
        let skipped_duplicate = items.len() - fresh.len();

        if fresh.is_empty() {
            info!(skipped_duplicate, "Nothing new to store");
            return Ok(PersistOutcome {
                written: 0,
                skipped_duplicate,
                path: None,
            });
        }

        let run = self.run.load(Ordering::SeqCst);
        let stamp = run_stamp(run_at, self.timezone);
        let mut run_file = match current.take() {
            Some(rf) if rf.run == run && rf.stamp == stamp => rf,
            _ => {
                let path = self.unused_path(prefix, &stamp).await?;
                RunFile {
                    run,
                    stamp,
                    path,
                    items: Vec::new(),
                }
            }
        };

        let before = run_file.items.len();
        run_file.items.extend(fresh.iter().cloned());
        let written = write_records(&run_file.path, &run_file.items).await;
        if let Err(e) = written {
            run_file.items.truncate(before);
            if before > 0 {
                *current = Some(run_file);
            }
            return Err(e);
        }

        seen.extend(fresh.iter().map(|item| item.link.clone()));
        let path = run_file.path.clone();
        *current = Some(run_file);

        info!(written = fresh.len(), skipped_duplicate, path = %path.display(), "Stored raw items");
        Ok(PersistOutcome {
            written: fresh.len(),
            skipped_duplicate,
            path: Some(path),
        })
    }

    /// Links among `items` that are already stored for `source_id`.
    pub async fn stored_links(
        &self,
        source_id: &str,
        items: &[RawItem],
    ) -> Result<HashSet<String>, StorageError> {
        let prefix = self
            .prefixes
            .get(source_id)
            .ok_or_else(|| StorageError::UnknownSource(source_id.to_string()))?;
        let shard = self.shard(source_id);
        let mut shard = shard.lock().await;
        self.ensure_seen(&mut shard, prefix).await?;
        let Some(seen) = shard.seen.as_ref() else {
            return Ok(HashSet::new());
        };
        Ok(items
            .iter()
            .filter(|item| seen.contains(&item.link))
            .map(|item| item.link.clone())
            .collect())
    }

    async fn ensure_seen(&self, shard: &mut Shard, prefix: &str) -> Result<(), StorageError> {
        if shard.seen.is_none() {
            let loaded = self.load_seen(prefix).await?;
            debug!(known = loaded.len(), "Loaded stored links");
            shard.seen = Some(loaded);
        }
        Ok(())
    }

    /// First `{prefix}_{stamp}[_{n}].json` that does not exist yet.
    async fn unused_path(&self, prefix: &str, stamp: &str) -> Result<PathBuf, StorageError> {
        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("{prefix}_{stamp}.json")
            } else {
                format!("{prefix}_{stamp}_{n}.json")
            };
            let candidate = self.root.join(name);
            let exists = fs::try_exists(&candidate)
                .await
                .map_err(|source| StorageError::Read {
                    path: candidate.clone(),
                    source,
                })?;
            if !exists {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Links of every stored record belonging to `prefix`.
    async fn load_seen(&self, prefix: &str) -> Result<HashSet<String>, StorageError> {
        let mut seen = HashSet::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(seen),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let read_err = |source| StorageError::Read {
            path: self.root.clone(),
            source,
        };
        while let Some(entry) = dir.next_entry().await.map_err(read_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !is_run_file(name, prefix) {
                continue;
            }
            let path = entry.path();
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| StorageError::Read {
                    path: path.clone(),
                    source,
                })?;
            let records: Vec<StoredLink> =
                serde_json::from_str(&text).map_err(|source| StorageError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            seen.extend(records.into_iter().map(|r| r.link));
        }
        Ok(seen)
    }
}

/// Whether `name` is a run file of `prefix` (and not of a longer prefix that
/// happens to start with it).
pub fn is_run_file(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|stamp| RUN_FILE_STAMP.is_match(stamp))
}

async fn write_records(path: &Path, items: &[RawItem]) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(items)?;
    write_atomic(path, &json).await
}

/// Read back a run file. This is what downstream enrichment consumes.
pub async fn read_records(path: &Path) -> Result<Vec<RawItem>, StorageError> {
    let text = fs::read_to_string(path)
        .await
        .map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&text).map_err(|source| StorageError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}
