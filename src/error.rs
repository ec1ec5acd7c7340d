//! Error taxonomy for the ingestion core.
//!
//! Only [`ConfigError`] is fatal. Everything raised while working on a single
//! channel or source ([`FetchError`], [`ParseError`], [`StorageError`]) is
//! caught by the coordinator and turned into a
//! [`RunError`](crate::models::RunError) entry.

use crate::models::ChannelKey;
use std::path::PathBuf;
use thiserror::Error;

/// Bad or missing configuration. Aborts startup before any fetch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("missing required section `{0}`")]
    MissingSection(&'static str),

    #[error("{scope}: missing required key `{field}`")]
    MissingField { scope: String, field: &'static str },

    #[error("{scope}: invalid URL `{url}`: {reason}")]
    InvalidUrl {
        scope: String,
        url: String,
        reason: String,
    },

    #[error("{scope}: category must not be empty")]
    EmptyCategory { scope: String },

    #[error("raw_prefix `{prefix}` is used by both `{first}` and `{second}`")]
    DuplicatePrefix {
        prefix: String,
        first: String,
        second: String,
    },

    #[error("unknown timezone `{value}`: {reason}")]
    InvalidTimezone { value: String, reason: String },

    #[error("{scope}: `{field}` {reason}")]
    InvalidValue {
        scope: String,
        field: &'static str,
        reason: String,
    },
}

/// One HTTP attempt failed. Every variant is treated as transient.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}")]
    Status { status: u16 },
}

/// A channel could not be retrieved within its retry budget.
#[derive(Debug, Error)]
#[error("fetching {channel} failed after {attempts} attempt(s): {last}")]
pub struct FetchError {
    pub channel: ChannelKey,
    pub attempts: u32,
    #[source]
    pub last: TransportError,
}

/// The channel answered, but not with a feed we can read. Never retried.
#[derive(Debug, Error)]
#[error("malformed feed for {channel}: {reason}")]
pub struct ParseError {
    pub channel: ChannelKey,
    pub reason: String,
}

/// Raw store or fetch-state persistence failure.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no raw store registered for source `{0}`")]
    UnknownSource(String),

    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything that can go wrong while processing one fetch task.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_names_the_channel() {
        let err = FetchError {
            channel: ChannelKey::new("lenta.ru", "world"),
            attempts: 4,
            last: TransportError::Timeout,
        };
        let msg = err.to_string();
        assert!(msg.contains("lenta.ru/world"));
        assert!(msg.contains("4 attempt"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn ingest_error_is_transparent() {
        let err: IngestError = ParseError {
            channel: ChannelKey::new("ria.ru", "main"),
            reason: "unexpected EOF".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "malformed feed for ria.ru/main: unexpected EOF");
    }
}
