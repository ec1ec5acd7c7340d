//! Command-line interface definitions for news_ingest.
//!
//! Every invocation performs one run: fetch whatever is due, store new items,
//! print a summary and exit. Periodic execution is left to cron or a systemd
//! timer.

use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments.
///
/// # Examples
///
/// ```sh
/// # Fetch every channel that is due
/// news_ingest --config config/settings.yaml
///
/// # Ignore the fetch log and refetch everything, two channels at a time
/// news_ingest -c config/settings.yaml --force --max-concurrency 2
///
/// # Config path from the environment, machine-readable output
/// NEWS_INGEST_CONFIG=/etc/news_ingest.yaml news_ingest --json-logs --summary-json run.json
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "NEWS_INGEST_CONFIG")]
    pub config: PathBuf,

    /// Treat every enabled channel as due, ignoring the fetch log
    #[arg(short, long)]
    pub force: bool,

    /// Override `common.system.max_concurrency`
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Also write the run summary as JSON to this path
    #[arg(long)]
    pub summary_json: Option<PathBuf>,

    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long)]
    pub json_logs: bool,
}
