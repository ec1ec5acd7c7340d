//! # news_ingest
//!
//! Fetches news RSS channels on a schedule and keeps an append-only,
//! link-deduplicated raw store for downstream enrichment.
//!
//! ## Usage
//!
//! ```sh
//! news_ingest --config config/settings.yaml
//! ```
//!
//! ## Exit status
//!
//! - `0`: at least one channel succeeded, or nothing was due
//! - `1`: every source that ran failed (or the raw directory is unusable)
//! - `2`: the configuration could not be loaded

use chrono::Utc;
use clap::Parser;
use news_ingest::cli::Cli;
use news_ingest::config::Registry;
use news_ingest::coordinator::Coordinator;
use news_ingest::fetcher::HttpFeedClient;
use news_ingest::utils::{ensure_writable_dir, write_atomic};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

const EXIT_ALL_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.json_logs);

    let start_time = std::time::Instant::now();
    info!("news_ingest starting up");
    debug!(config = %args.config.display(), force = args.force, "Parsed CLI arguments");

    let registry = match Registry::load(&args.config) {
        Ok(registry) => registry,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "Invalid configuration");
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Early check: ensure the raw data dir is writable
    let raw_dir = registry.settings.raw_data_dir.clone();
    if let Err(e) = ensure_writable_dir(&raw_dir).await {
        error!(
            path = %raw_dir.display(),
            error = %e,
            "Raw data directory is not writable (fix perms or choose a different path)"
        );
        return ExitCode::from(EXIT_ALL_FAILED);
    }

    let client = match HttpFeedClient::from_settings(&registry.settings) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Could not build HTTP client");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut coordinator = Coordinator::new(registry, client).with_force(args.force);
    if let Some(n) = args.max_concurrency {
        coordinator = coordinator.with_max_concurrency(n);
    }

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight channels");
            cancel.cancel();
        }
    });

    let result = coordinator.run_once(Utc::now()).await;
    print!("{}", result.render());

    if let Some(path) = &args.summary_json {
        let written = match serde_json::to_vec_pretty(&result) {
            Ok(json) => write_atomic(path, &json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => info!(path = %path.display(), "Wrote run summary"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to write run summary"),
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        elapsed_secs = elapsed.as_secs_f64(),
        written = result.total_written(),
        errors = result.errors.len(),
        "news_ingest finished"
    );

    if result.all_sources_failed() {
        error!("Every source failed");
        return ExitCode::from(EXIT_ALL_FAILED);
    }
    ExitCode::SUCCESS
}
