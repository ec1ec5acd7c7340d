//! Source registry: loads and validates the YAML configuration.
//!
//! The file has two top-level sections:
//!
//! ```yaml
//! common:
//!   system:
//!     raw_data_dir: data/raw
//!     request_timeout: 10        # seconds, per attempt
//!     max_retries: 3
//!     lookback_hours: 12
//!     parser_timezone: Europe/Moscow
//!   defaults:
//!     max_news: 10
//!     user_agent: "Mozilla/5.0 (compatible; news_ingest)"
//! sources:
//!   ria.ru:
//!     raw_prefix: ria
//!     rss_channels:
//!       main:     { url: "https://ria.ru/export/rss2/archive/index.xml", category: general }
//!       politics: { url: "https://ria.ru/export/rss2/politics/index.xml", category: politics, max_news: 15 }
//! ```
//!
//! Unknown keys are ignored. Everything is validated up front so that a run
//! never starts with a half-usable configuration.

use crate::error::ConfigError;
use crate::models::ChannelKey;
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_STATE_FILE: &str = ".fetch_state.json";
/// Ten years; keeps every lookback computation inside chrono's date range.
const MAX_LOOKBACK_HOURS: u32 = 24 * 366 * 10;

/// Process-wide settings, fixed after load.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Directory holding the raw JSON files.
    pub raw_data_dir: PathBuf,
    /// Timeout applied to every HTTP attempt.
    pub request_timeout: Duration,
    /// Retries after the first attempt; a channel gets `max_retries + 1` tries.
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub retry_max_delay: Duration,
    /// Random extra delay added on top of each backoff sleep.
    pub retry_jitter: Duration,
    /// How old a channel's last fetch may get before it is due again.
    pub lookback_hours: u32,
    /// Timezone used for scheduling, timestamps and file names.
    pub timezone: Tz,
    /// Item limit when neither the channel nor its source sets one.
    pub default_max_news: usize,
    pub user_agent: String,
    /// Maximum number of channels fetched at the same time.
    pub max_concurrency: usize,
    /// Where last-fetch times are kept between runs.
    pub state_file: PathBuf,
    /// Drop items published before the lookback window.
    pub skip_stale_items: bool,
}

impl RuntimeSettings {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.lookback_hours))
    }
}

/// One RSS channel of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub url: Url,
    pub category: String,
    pub max_news: Option<usize>,
}

/// One news source and its channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: String,
    pub raw_prefix: String,
    pub max_news: Option<usize>,
    pub enabled: bool,
    /// CSS selector for the article body; enables full-text retrieval.
    pub article_selector: Option<String>,
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Validated configuration: runtime settings plus all sources, keyed by id.
#[derive(Debug, Clone)]
pub struct Registry {
    pub settings: RuntimeSettings,
    pub sources: BTreeMap<String, SourceConfig>,
}

impl Registry {
    /// Read and validate the configuration file at `path`.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_yaml_str(&text)?;
        info!(
            sources = registry.sources.len(),
            channels = registry.channels().count(),
            "Configuration loaded"
        );
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        raw.validate()
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.get(id)
    }

    /// Every active (source, channel) pair, ascending by source id then channel.
    pub fn channels(&self) -> impl Iterator<Item = (&SourceConfig, &ChannelConfig)> {
        self.sources
            .values()
            .filter(|s| s.enabled)
            .flat_map(|s| s.channels.values().map(move |c| (s, c)))
    }

    pub fn lookup(&self, key: &ChannelKey) -> Option<(&SourceConfig, &ChannelConfig)> {
        let source = self.sources.get(&key.source)?;
        let channel = source.channels.get(&key.channel)?;
        Some((source, channel))
    }

    /// Item limit for a channel: channel override, then source override, then
    /// the global default. `None` when the pair is not configured.
    pub fn resolve_limit(&self, source: &str, channel: &str) -> Option<usize> {
        let src = self.sources.get(source)?;
        let chan = src.channels.get(channel)?;
        Some(self.limit_for(src, chan))
    }

    pub fn limit_for(&self, source: &SourceConfig, channel: &ChannelConfig) -> usize {
        channel
            .max_news
            .or(source.max_news)
            .unwrap_or(self.settings.default_max_news)
    }

    /// Map of source id to raw file prefix.
    pub fn prefixes(&self) -> HashMap<String, String> {
        self.sources
            .values()
            .map(|s| (s.id.clone(), s.raw_prefix.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    common: Option<RawCommon>,
    sources: Option<BTreeMap<String, RawSource>>,
}

#[derive(Debug, Deserialize)]
struct RawCommon {
    system: Option<RawSystem>,
    defaults: Option<RawDefaults>,
}

#[derive(Debug, Deserialize)]
struct RawSystem {
    raw_data_dir: Option<PathBuf>,
    request_timeout: Option<u64>,
    max_retries: Option<u32>,
    lookback_hours: Option<u32>,
    #[serde(alias = "timezone")]
    parser_timezone: Option<String>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    retry_jitter_ms: Option<u64>,
    max_concurrency: Option<usize>,
    state_file: Option<PathBuf>,
    skip_stale_items: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawDefaults {
    max_news: Option<usize>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    raw_prefix: Option<String>,
    max_news: Option<usize>,
    enabled: Option<bool>,
    article_selector: Option<String>,
    rss_channels: Option<BTreeMap<String, RawChannel>>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    url: Option<String>,
    category: Option<String>,
    max_news: Option<usize>,
}

fn required<T>(value: Option<T>, scope: &str, field: &'static str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingField {
        scope: scope.to_string(),
        field,
    })
}

fn positive(value: usize, scope: &str, field: &'static str) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            scope: scope.to_string(),
            field,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

impl RawConfig {
    fn validate(self) -> Result<Registry, ConfigError> {
        let common = self.common.ok_or(ConfigError::MissingSection("common"))?;
        let system = common
            .system
            .ok_or(ConfigError::MissingSection("common.system"))?;
        let defaults = common
            .defaults
            .ok_or(ConfigError::MissingSection("common.defaults"))?;
        let settings = validate_settings(system, defaults)?;

        let raw_sources = self.sources.ok_or(ConfigError::MissingSection("sources"))?;
        if raw_sources.is_empty() {
            return Err(ConfigError::MissingSection("sources"));
        }

        let mut prefix_owner: HashMap<String, String> = HashMap::new();
        let mut sources = BTreeMap::new();
        for (id, raw) in raw_sources {
            let source = validate_source(&id, raw)?;
            if let Some(first) = prefix_owner.insert(source.raw_prefix.clone(), id.clone()) {
                return Err(ConfigError::DuplicatePrefix {
                    prefix: source.raw_prefix,
                    first,
                    second: id,
                });
            }
            debug!(source = %id, channels = source.channels.len(), "Validated source");
            sources.insert(id, source);
        }

        Ok(Registry { settings, sources })
    }
}

fn validate_settings(system: RawSystem, defaults: RawDefaults) -> Result<RuntimeSettings, ConfigError> {
    const SYS: &str = "common.system";
    const DEF: &str = "common.defaults";

    let raw_data_dir = required(system.raw_data_dir, SYS, "raw_data_dir")?;
    let request_timeout = required(system.request_timeout, SYS, "request_timeout")?;
    positive(request_timeout as usize, SYS, "request_timeout")?;
    let lookback_hours = required(system.lookback_hours, SYS, "lookback_hours")?;
    if lookback_hours > MAX_LOOKBACK_HOURS {
        return Err(ConfigError::InvalidValue {
            scope: SYS.to_string(),
            field: "lookback_hours",
            reason: format!("must be at most {MAX_LOOKBACK_HOURS}"),
        });
    }
    let tz_name = required(system.parser_timezone, SYS, "parser_timezone")?;
    let timezone: Tz = tz_name
        .parse()
        .map_err(|e| ConfigError::InvalidTimezone {
            value: tz_name.clone(),
            reason: format!("{e}"),
        })?;

    let default_max_news = positive(required(defaults.max_news, DEF, "max_news")?, DEF, "max_news")?;
    let user_agent = required(defaults.user_agent, DEF, "user_agent")?;
    let max_concurrency = positive(
        system.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY),
        SYS,
        "max_concurrency",
    )?;
    let state_file = system
        .state_file
        .unwrap_or_else(|| raw_data_dir.join(DEFAULT_STATE_FILE));

    Ok(RuntimeSettings {
        raw_data_dir,
        request_timeout: Duration::from_secs(request_timeout),
        max_retries: system.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        retry_base_delay: Duration::from_millis(
            system.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
        ),
        retry_max_delay: Duration::from_millis(
            system.retry_max_delay_ms.unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS),
        ),
        retry_jitter: Duration::from_millis(system.retry_jitter_ms.unwrap_or(0)),
        lookback_hours,
        timezone,
        default_max_news,
        user_agent,
        max_concurrency,
        state_file,
        skip_stale_items: system.skip_stale_items.unwrap_or(true),
    })
}

fn validate_source(id: &str, raw: RawSource) -> Result<SourceConfig, ConfigError> {
    let scope = format!("sources.{id}");
    let raw_prefix = required(raw.raw_prefix, &scope, "raw_prefix")?;
    if raw_prefix.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            scope,
            field: "raw_prefix",
            reason: "must not be empty".to_string(),
        });
    }
    if let Some(max) = raw.max_news {
        positive(max, &scope, "max_news")?;
    }
    if let Some(selector) = &raw.article_selector {
        scraper::Selector::parse(selector).map_err(|e| ConfigError::InvalidValue {
            scope: scope.clone(),
            field: "article_selector",
            reason: format!("is not a valid CSS selector: {e}"),
        })?;
    }

    let raw_channels = required(raw.rss_channels, &scope, "rss_channels")?;
    let mut channels = BTreeMap::new();
    for (name, chan) in raw_channels {
        let chan_scope = format!("{scope}.rss_channels.{name}");
        let url_text = required(chan.url, &chan_scope, "url")?;
        let url = parse_feed_url(&url_text, &chan_scope)?;
        let category = required(chan.category, &chan_scope, "category")?;
        if category.trim().is_empty() {
            return Err(ConfigError::EmptyCategory { scope: chan_scope });
        }
        if let Some(max) = chan.max_news {
            positive(max, &chan_scope, "max_news")?;
        }
        channels.insert(
            name.clone(),
            ChannelConfig {
                name,
                url,
                category,
                max_news: chan.max_news,
            },
        );
    }

    Ok(SourceConfig {
        id: id.to_string(),
        raw_prefix,
        max_news: raw.max_news,
        enabled: raw.enabled.unwrap_or(true),
        article_selector: raw.article_selector,
        channels,
    })
}

fn parse_feed_url(text: &str, scope: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        scope: scope.to_string(),
        url: text.to_string(),
        reason,
    };
    let url = Url::parse(text.trim()).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        "http" | "https" => Err(invalid("missing host".to_string())),
        other => Err(invalid(format!("unsupported scheme `{other}`"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
common:
  system:
    raw_data_dir: data/raw
    request_timeout: 10
    max_retries: 3
    lookback_hours: 12
    parser_timezone: Europe/Moscow
    log_level: INFO
  defaults:
    max_news: 10
    user_agent: "Mozilla/5.0 (compatible; news_ingest/0.1)"
sources:
  ria.ru:
    raw_prefix: ria
    rss_channels:
      main:
        url: https://ria.ru/export/rss2/archive/index.xml
        category: general
      politics:
        url: https://ria.ru/export/rss2/politics/index.xml
        category: politics
        max_news: 15
  lenta.ru:
    raw_prefix: lenta
    max_news: 20
    rss_channels:
      world:
        url: https://lenta.ru/rss/news/world
        category: world
      economics:
        url: https://lenta.ru/rss/news/economics
        category: economics
        max_news: 5
"#;

    fn with_sources(sources: &str) -> String {
        let head = SAMPLE.split("sources:").next().unwrap();
        format!("{head}sources:\n{sources}")
    }

    #[test]
    fn loads_every_channel() {
        let reg = Registry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(reg.sources.len(), 2);
        assert_eq!(reg.channels().count(), 4);
        assert_eq!(reg.settings.timezone, chrono_tz::Europe::Moscow);
        assert_eq!(reg.settings.request_timeout, Duration::from_secs(10));
        assert_eq!(reg.settings.max_retries, 3);
        assert_eq!(reg.settings.state_file, PathBuf::from("data/raw/.fetch_state.json"));
    }

    #[test]
    fn resolve_limit_uses_layered_overrides() {
        let reg = Registry::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(reg.resolve_limit("ria.ru", "main"), Some(10));
        assert_eq!(reg.resolve_limit("ria.ru", "politics"), Some(15));
        assert_eq!(reg.resolve_limit("lenta.ru", "world"), Some(20));
        assert_eq!(reg.resolve_limit("lenta.ru", "economics"), Some(5));
        assert_eq!(reg.resolve_limit("lenta.ru", "sport"), None);
        assert_eq!(reg.resolve_limit("tass.ru", "main"), None);
    }

    #[test]
    fn every_channel_gets_a_resolved_limit() {
        let reg = Registry::from_yaml_str(SAMPLE).unwrap();
        for (source, channel) in reg.channels() {
            let expected = channel
                .max_news
                .or(source.max_news)
                .unwrap_or(reg.settings.default_max_news);
            assert_eq!(reg.resolve_limit(&source.id, &channel.name), Some(expected));
        }
    }

    #[test]
    fn channels_are_ordered_by_source_then_name() {
        let reg = Registry::from_yaml_str(SAMPLE).unwrap();
        let keys: Vec<String> = reg
            .channels()
            .map(|(s, c)| format!("{}/{}", s.id, c.name))
            .collect();
        assert_eq!(
            keys,
            vec!["lenta.ru/economics", "lenta.ru/world", "ria.ru/main", "ria.ru/politics"]
        );
    }

    #[test]
    fn missing_url_is_rejected() {
        let yaml = with_sources(
            "  ria.ru:\n    raw_prefix: ria\n    rss_channels:\n      main:\n        category: general\n",
        );
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "url", .. }), "{err}");
    }

    #[test]
    fn missing_category_is_rejected() {
        let yaml = with_sources(
            "  ria.ru:\n    raw_prefix: ria\n    rss_channels:\n      main:\n        url: https://ria.ru/rss\n",
        );
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "category", .. }));
    }

    #[test]
    fn blank_category_is_rejected() {
        let yaml = with_sources(
            "  ria.ru:\n    raw_prefix: ria\n    rss_channels:\n      main:\n        url: https://ria.ru/rss\n        category: \"  \"\n",
        );
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCategory { .. }));
    }

    #[test]
    fn malformed_url_is_rejected() {
        let yaml = with_sources(
            "  ria.ru:\n    raw_prefix: ria\n    rss_channels:\n      main:\n        url: not a url\n        category: general\n",
        );
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));

        let yaml = with_sources(
            "  ria.ru:\n    raw_prefix: ria\n    rss_channels:\n      main:\n        url: ftp://ria.ru/rss\n        category: general\n",
        );
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn colliding_prefixes_are_rejected() {
        let yaml = with_sources(
            "  a.ru:\n    raw_prefix: news\n    rss_channels:\n      main: { url: \"https://a.ru/rss\", category: x }\n  b.ru:\n    raw_prefix: news\n    rss_channels:\n      main: { url: \"https://b.ru/rss\", category: x }\n",
        );
        match Registry::from_yaml_str(&yaml).unwrap_err() {
            ConfigError::DuplicatePrefix { prefix, first, second } => {
                assert_eq!(prefix, "news");
                assert_eq!(first, "a.ru");
                assert_eq!(second, "b.ru");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_sections_are_rejected() {
        let err = Registry::from_yaml_str("sources: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("common")));

        let err = Registry::from_yaml_str("common:\n  system: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("common.defaults")));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let yaml = SAMPLE.replace("Europe/Moscow", "Mars/Olympus_Mons");
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTimezone { .. }));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let yaml = SAMPLE.replace("max_news: 15", "max_news: 0");
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "max_news", .. }));
    }

    #[test]
    fn out_of_range_lookback_is_rejected() {
        let yaml = SAMPLE.replace("lookback_hours: 12", "lookback_hours: 4000000000");
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "lookback_hours", .. }), "{err}");

        let yaml = SAMPLE.replace("lookback_hours: 12", "lookback_hours: 87840");
        let reg = Registry::from_yaml_str(&yaml).unwrap();
        assert_eq!(reg.settings.lookback(), chrono::Duration::hours(87_840));
    }

    #[test]
    fn invalid_article_selector_is_rejected() {
        let yaml = SAMPLE.replace("raw_prefix: ria\n", "raw_prefix: ria\n    article_selector: \"div[[\"\n");
        let err = Registry::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "article_selector", .. }));
    }

    #[test]
    fn disabled_sources_are_not_active() {
        let yaml = SAMPLE.replace("raw_prefix: lenta\n", "raw_prefix: lenta\n    enabled: false\n");
        let reg = Registry::from_yaml_str(&yaml).unwrap();
        assert_eq!(reg.channels().count(), 2);
        assert!(reg.channels().all(|(s, _)| s.id == "ria.ru"));
    }

    #[test]
    fn shipped_settings_load() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/settings.yaml");
        let reg = Registry::load(&path).unwrap();
        assert_eq!(reg.settings.retry_jitter, Duration::from_millis(250));
        assert_eq!(
            reg.source("lenta.ru").unwrap().article_selector.as_deref(),
            Some(".topic-body__content")
        );
        assert_eq!(reg.resolve_limit("lenta.ru", "world"), Some(20));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Registry::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
