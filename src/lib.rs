//! Scheduled multi-source RSS ingestion.
//!
//! ## Architecture
//!
//! 1. **Registry** ([`config`]): validated sources, channels and settings
//! 2. **Scheduling** ([`scheduler`]): which channels are due, given the fetch log
//! 3. **Fetching** ([`fetcher`]): HTTP with retry and backoff, feed parsing
//! 4. **Storage** ([`outputs`]): link-deduplicated, append-only raw JSON files
//! 5. **Coordination** ([`coordinator`]): one bounded-concurrency run and its summary

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod outputs;
pub mod scheduler;
pub mod utils;

pub use config::Registry;
pub use coordinator::Coordinator;
pub use error::{ConfigError, FetchError, IngestError, ParseError, StorageError, TransportError};
pub use models::{ChannelKey, RawItem, RunResult};
