//! Small helpers shared by the store, scheduler and fetcher.
//!
//! - Identifier extraction from article links
//! - Run stamps used in raw file names
//! - File system helpers (writable directory check, atomic replace)

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Format of the timestamp part of raw file names (`ria_20250314_1200.json`).
pub const RUN_STAMP_FORMAT: &str = "%Y%m%d_%H%M";

/// Numeric id patterns seen in news links, most specific first.
static NUMERIC_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"-(\d+)\.html$",
        r"-(\d+)/?$",
        r"/(\d+)\.html$",
        r"/(\d+)/?$",
        r"_(\d+)\.html$",
        r"(\d{8,})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Derive a short identifier for a news link.
///
/// Looks for a numeric article id first (`.../world-1998877665.html` ->
/// `1998877665`), then falls back to the last non-empty path segment
/// (`https://lenta.ru/news/2024/05/15/coffee/` -> `coffee`), and finally to
/// the link itself.
pub fn extract_news_id(link: &str) -> String {
    let clean = link
        .split(['?', '#'])
        .next()
        .unwrap_or(link)
        .trim_end_matches('/');

    for pattern in NUMERIC_ID_PATTERNS.iter() {
        if let Some(id) = pattern.captures(clean).and_then(|c| c.get(1)) {
            return id.as_str().to_string();
        }
    }

    Url::parse(link)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .unwrap_or_else(|| link.to_string())
}

/// Timestamp of a run in the configured timezone, as used in raw file names.
pub fn run_stamp(now: DateTime<Utc>, tz: Tz) -> String {
    now.with_timezone(&tz).format(RUN_STAMP_FORMAT).to_string()
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and removes a marker file.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    let marker = path.join(".__write_check__");
    fs::write(&marker, b"")
        .await
        .map_err(|source| StorageError::Write {
            path: marker.clone(),
            source,
        })?;
    let _ = fs::remove_file(&marker).await;
    info!("Output directory is writable");
    Ok(())
}

/// Replace `path` with `contents` via a sibling temp file and a rename, so
/// readers never observe a half-written file.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let write = async {
        fs::write(&tmp, contents).await?;
        fs::rename(&tmp, path).await?;
        Ok::<(), io::Error>(())
    };
    if let Err(source) = write.await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StorageError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
