//! Run coordination.
//!
//! One run goes through these steps:
//!
//! 1. Load the [`FetchLog`] (a broken log is reported and treated as empty)
//! 2. Ask the scheduler which channels are due (all of them with `force`)
//! 3. Process due channels with at most `max_concurrency` in flight:
//!    fetch, drop stale items, fill article text for links not yet stored,
//!    persist
//! 4. Record successful channels in the log and save it
//!
//! A failing channel only produces a [`RunError`]; every other channel still
//! runs. Cancellation is cooperative: the token is checked before a task
//! starts, and tasks already in flight are allowed to finish.

use crate::config::{ChannelConfig, Registry, SourceConfig};
use crate::error::IngestError;
use crate::fetcher::{FeedClient, FeedFetcher};
use crate::models::{ErrorKind, FetchTask, RawItem, RunError, RunResult, TaskReport, TaskState};
use crate::outputs::RawStore;
use crate::scheduler::{FetchLog, all_tasks, due_tasks};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

pub struct Coordinator<C> {
    registry: Registry,
    fetcher: FeedFetcher<C>,
    store: RawStore,
    cancel: CancellationToken,
    force: bool,
    max_concurrency: usize,
}

impl<C: FeedClient> Coordinator<C> {
    pub fn new(registry: Registry, client: C) -> Self {
        let fetcher = FeedFetcher::new(client, &registry.settings);
        let store = RawStore::from_registry(&registry);
        let max_concurrency = registry.settings.max_concurrency;
        Self {
            registry,
            fetcher,
            store,
            cancel: CancellationToken::new(),
            force: false,
            max_concurrency,
        }
    }

    /// Treat every active channel as due, ignoring the fetch log.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Override the configured concurrency. Zero is raised to one.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Token that stops the run from starting further tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fetch and store every due channel once.
    ///
    /// `now` drives scheduling, the stale cutoff, file names and the
    /// timestamps written to the fetch log.
    #[instrument(level = "info", skip_all, fields(force = self.force, max_concurrency = self.max_concurrency))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> RunResult {
        let mut result = RunResult::new(now);
        self.store.begin_run();
        let state_file = &self.registry.settings.state_file;

        let mut log = match FetchLog::load(state_file).await {
            Ok(log) => log,
            Err(e) => {
                warn!(error = %e, "Fetch state unreadable; treating every channel as never fetched");
                result.errors.push(RunError {
                    scope: state_file.display().to_string(),
                    kind: ErrorKind::Storage,
                    message: e.to_string(),
                });
                FetchLog::new()
            }
        };

        let tasks = if self.force {
            all_tasks(&self.registry, now)
        } else {
            due_tasks(&self.registry, now, &log)
        };
        info!(due = tasks.len(), known = log.len(), "Scheduled channels");

        let cancel = &self.cancel;
        let mut reports: Vec<TaskReport> = Vec::with_capacity(tasks.len());
        let mut cancelled = 0usize;
        let outcomes: Vec<Option<TaskReport>> = stream::iter(tasks.iter())
            .filter_map(|task| async move {
                let resolved = self.registry.lookup(&task.key);
                if resolved.is_none() {
                    warn!(channel = %task.key, "Scheduled channel is not configured; skipping");
                }
                resolved.map(|(source, channel)| (task, source, channel))
            })
            .map(|(task, source, channel)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.run_task(task, source, channel, now).await)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Some(report) => reports.push(report),
                None => cancelled += 1,
            }
        }
        reports.sort_by(|a, b| a.key.cmp(&b.key));

        let mut recorded = 0usize;
        for report in reports {
            if report.succeeded() {
                log.record(report.key.clone(), now);
                recorded += 1;
            }
            result.record(report);
        }
        result.cancelled = cancelled;
        if cancelled > 0 {
            warn!(cancelled, "Run cancelled before every channel started");
        }

        if recorded > 0 {
            if let Err(e) = log.save(state_file).await {
                warn!(error = %e, "Could not save fetch state");
                result.errors.push(RunError {
                    scope: state_file.display().to_string(),
                    kind: ErrorKind::Storage,
                    message: e.to_string(),
                });
            }
        }

        result.finished_at = Some(Utc::now());
        info!(
            tasks = result.tasks.len(),
            written = result.total_written(),
            errors = result.errors.len(),
            cancelled,
            "Run finished"
        );
        result
    }

    #[instrument(level = "info", skip_all, fields(channel = %task.key, due_at = %task.due_at))]
    async fn run_task(
        &self,
        task: &FetchTask,
        source: &SourceConfig,
        channel: &ChannelConfig,
        now: DateTime<Utc>,
    ) -> TaskReport {
        let mut report = TaskReport::new(task.key.clone());

        report.advance(TaskState::Fetching);
        let limit = self.registry.limit_for(source, channel);
        let items = match self.fetcher.fetch(source, channel, limit, now).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Channel failed");
                report.fail(TaskState::FetchFailed, &e);
                report.advance(TaskState::Done);
                return report;
            }
        };
        report.advance(TaskState::Fetched);
        report.fetched = items.len();

        let mut items = if self.registry.settings.skip_stale_items {
            let (fresh, stale) = split_stale(items, now - self.registry.settings.lookback());
            report.skipped_stale = stale;
            fresh
        } else {
            items
        };

        if source.article_selector.is_some() {
            let known = match self.store.stored_links(&source.id, &items).await {
                Ok(known) => known,
                Err(e) => {
                    warn!(error = %e, "Could not check stored links; fetching every article");
                    HashSet::new()
                }
            };
            self.fetcher.fill_articles(source, &mut items, &known, now).await;
        }

        match self.store.persist(&source.id, &items, now).await {
            Ok(outcome) => {
                report.advance(TaskState::Persisted);
                report.written = outcome.written;
                report.skipped_duplicate = outcome.skipped_duplicate;
                report.file = outcome.path;
            }
            Err(e) => {
                let e = IngestError::from(e);
                warn!(error = %e, "Persisting channel failed");
                report.fail(TaskState::PersistFailed, &e);
            }
        }
        report.advance(TaskState::Done);
        report
    }
}

/// Keep items published at or after `cutoff` (undated items included) and
/// count the rest.
fn split_stale(items: Vec<RawItem>, cutoff: DateTime<Utc>) -> (Vec<RawItem>, usize) {
    let total = items.len();
    let fresh: Vec<RawItem> = items
        .into_iter()
        .filter(|item| item.published_at.is_none_or(|p| p.with_timezone(&Utc) >= cutoff))
        .collect();
    let stale = total - fresh.len();
    (fresh, stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::error::TransportError;
    use crate::fetcher::feed::tests::rss;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use url::Url;

    /// Serves scripted bodies per URL; unknown URLs time out.
    #[derive(Default)]
    struct Scripted {
        bodies: Mutex<HashMap<String, String>>,
        calls: Mutex<HashMap<String, u32>>,
    }

    impl Scripted {
        fn serve(self, url: &str, body: String) -> Self {
            self.replace(url, body);
            self
        }

        fn replace(&self, url: &str, body: String) {
            self.bodies.lock().unwrap().insert(url.to_string(), body);
        }

        fn calls(&self, url: &str) -> u32 {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl FeedClient for Scripted {
        async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
            *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
            self.bodies
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .ok_or(TransportError::Timeout)
        }
    }

    const RIA_MAIN: &str = "https://ria.ru/export/rss2/archive/index.xml";
    const RIA_POLITICS: &str = "https://ria.ru/export/rss2/politics/index.xml";
    const LENTA_WORLD: &str = "https://lenta.ru/rss/news/world";
    const LENTA_ECONOMICS: &str = "https://lenta.ru/rss/news/economics";

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()
    }

    fn registry(root: &Path) -> Registry {
        let yaml = SAMPLE
            .replace("data/raw", &root.display().to_string())
            .replace("max_retries: 3", "max_retries: 3\n    retry_base_delay_ms: 0");
        Registry::from_yaml_str(&yaml).unwrap()
    }

    fn feed(prefix: &str, n: usize) -> String {
        let entries: Vec<(String, String)> = (0..n)
            .map(|i| (format!("{prefix} {i}"), format!("https://{prefix}.example/2025/{prefix}-{i}.html")))
            .collect();
        let refs: Vec<(&str, &str, &str)> = entries
            .iter()
            .map(|(t, l)| (t.as_str(), l.as_str(), "Fri, 14 Mar 2025 08:00:00 +0000"))
            .collect();
        rss(&refs)
    }

    #[tokio::test]
    async fn failing_channel_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(
            Scripted::default()
                .serve(RIA_MAIN, feed("main", 3))
                .serve(RIA_POLITICS, feed("politics", 2))
                .serve(LENTA_ECONOMICS, feed("economics", 2)),
        );
        let coordinator = Coordinator::new(registry(dir.path()), client.clone());

        let result = coordinator.run_once(now()).await;

        assert_eq!(result.tasks.len(), 4);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].scope, "lenta.ru/world");
        assert_eq!(result.errors[0].kind, ErrorKind::Fetch);
        assert_eq!(client.calls(LENTA_WORLD), 4);
        assert_eq!(client.calls(RIA_MAIN), 1);

        let ria = &result.sources["ria.ru"];
        assert_eq!(ria.written, 5);
        assert_eq!(ria.files.len(), 1);
        let lenta = &result.sources["lenta.ru"];
        assert_eq!(lenta.succeeded_channels, 1);
        assert_eq!(lenta.failed_channels, 1);
        assert!(!result.all_sources_failed());

        let world = result
            .tasks
            .iter()
            .find(|t| t.key.to_string() == "lenta.ru/world")
            .unwrap();
        assert_eq!(
            world.trail,
            vec![TaskState::Pending, TaskState::Fetching, TaskState::FetchFailed, TaskState::Done]
        );
    }

    #[tokio::test]
    async fn failed_channels_stay_due() {
        let dir = tempfile::tempdir().unwrap();
        let client = Scripted::default()
            .serve(RIA_MAIN, feed("main", 1))
            .serve(RIA_POLITICS, feed("politics", 1))
            .serve(LENTA_ECONOMICS, feed("economics", 1));
        let coordinator = Coordinator::new(registry(dir.path()), client);
        coordinator.run_once(now()).await;

        let second = coordinator.run_once(now() + Duration::hours(1)).await;
        let keys: Vec<String> = second.tasks.iter().map(|t| t.key.to_string()).collect();
        assert_eq!(keys, vec!["lenta.ru/world"]);
    }

    #[tokio::test]
    async fn force_refetches_everything() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(
            Scripted::default()
                .serve(RIA_MAIN, feed("main", 2))
                .serve(RIA_POLITICS, feed("politics", 2))
                .serve(LENTA_WORLD, feed("world", 2))
                .serve(LENTA_ECONOMICS, feed("economics", 2)),
        );
        let coordinator = Coordinator::new(registry(dir.path()), client.clone()).with_force(true);

        coordinator.run_once(now()).await;
        let again = coordinator.run_once(now() + Duration::minutes(5)).await;

        assert_eq!(again.tasks.len(), 4);
        assert_eq!(again.total_written(), 0);
        assert_eq!(again.sources["ria.ru"].skipped_duplicate, 4);
        assert_eq!(client.calls(RIA_MAIN), 2);
    }

    #[tokio::test]
    async fn stale_items_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let body = rss(&[
            ("Fresh", "https://ria.ru/20250314/fresh-1.html", "Fri, 14 Mar 2025 08:00:00 +0000"),
            ("Old", "https://ria.ru/20250312/old-2.html", "Wed, 12 Mar 2025 08:00:00 +0000"),
        ]);
        let client = Scripted::default().serve(RIA_MAIN, body);
        let coordinator = Coordinator::new(registry(dir.path()), client);

        let result = coordinator.run_once(now()).await;
        let main = result
            .tasks
            .iter()
            .find(|t| t.key.to_string() == "ria.ru/main")
            .unwrap();
        assert_eq!(main.fetched, 2);
        assert_eq!(main.skipped_stale, 1);
        assert_eq!(main.written, 1);
    }

    #[tokio::test]
    async fn runs_in_the_same_minute_write_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(Scripted::default().serve(RIA_MAIN, feed("main", 1)));
        let coordinator = Coordinator::new(registry(dir.path()), client.clone()).with_force(true);

        let first = coordinator.run_once(now() + Duration::seconds(5)).await;
        client.replace(RIA_MAIN, feed("main", 2));
        let second = coordinator.run_once(now() + Duration::seconds(35)).await;

        let first_file = dir.path().join("ria_20250314_1200.json");
        assert_eq!(first.sources["ria.ru"].files, vec![first_file.clone()]);
        assert_eq!(
            second.sources["ria.ru"].files,
            vec![dir.path().join("ria_20250314_1200_1.json")]
        );
        assert_eq!(second.sources["ria.ru"].written, 1);
        assert_eq!(crate::outputs::read_records(&first_file).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stored_links_skip_article_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = SAMPLE
            .replace("data/raw", &dir.path().display().to_string())
            .replace("max_retries: 3", "max_retries: 0")
            .replace("raw_prefix: ria\n", "raw_prefix: ria\n    article_selector: \".article__text\"\n");
        let registry = Registry::from_yaml_str(&yaml).unwrap();
        let page = |text: &str| format!(r#"<div class="article__text"><p>{text}</p></div>"#);
        let client = Arc::new(
            Scripted::default()
                .serve(RIA_MAIN, feed("main", 2))
                .serve("https://main.example/2025/main-0.html", page("Zero."))
                .serve("https://main.example/2025/main-1.html", page("One.")),
        );
        let coordinator = Coordinator::new(registry, client.clone()).with_force(true);

        let first = coordinator.run_once(now()).await;
        let file = first.sources["ria.ru"].files[0].clone();
        let stored = crate::outputs::read_records(&file).await.unwrap();
        assert_eq!(stored[0].raw_content, "Zero.");
        assert_eq!(stored[1].raw_content, "One.");

        coordinator.run_once(now() + Duration::hours(1)).await;
        assert_eq!(client.calls(RIA_MAIN), 2);
        assert_eq!(client.calls("https://main.example/2025/main-0.html"), 1);
        assert_eq!(client.calls("https://main.example/2025/main-1.html"), 1);
    }

    #[tokio::test]
    async fn cancelled_run_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(registry(dir.path()), Scripted::default());
        coordinator.cancellation_token().cancel();

        let result = coordinator.run_once(now()).await;
        assert!(result.tasks.is_empty());
        assert_eq!(result.cancelled, 4);
        assert!(!result.all_sources_failed());
        assert!(!dir.path().join(".fetch_state.json").exists());
    }

    #[test]
    fn split_stale_keeps_undated_items() {
        let cutoff = now() - Duration::hours(12);
        let at = |h: i64| Some((now() - Duration::hours(h)).fixed_offset());
        let make = |link: &str, published| RawItem {
            news_id: link.to_string(),
            title: link.to_string(),
            link: link.to_string(),
            published_at: published,
            source: "ria.ru".to_string(),
            channel: "main".to_string(),
            category: "general".to_string(),
            summary: None,
            raw_content: String::new(),
            fetched_at: now().fixed_offset(),
        };
        let items = vec![make("a", at(1)), make("b", at(13)), make("c", None), make("d", at(12))];
        let (fresh, stale) = split_stale(items, cutoff);
        let links: Vec<&str> = fresh.iter().map(|i| i.link.as_str()).collect();
        assert_eq!(links, vec!["a", "c", "d"]);
        assert_eq!(stale, 1);
    }
}
