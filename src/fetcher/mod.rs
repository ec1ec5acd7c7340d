//! Feed retrieval.
//!
//! # Submodules
//!
//! - [`client`]: the [`FeedClient`] seam and its `reqwest` implementation
//! - [`retry`]: pure backoff computation and the [`RetryClient`] decorator
//! - [`feed`]: feed document parsing into [`RawItem`]s
//! - [`article`]: optional article full-text extraction
//!
//! [`FeedFetcher`] ties them together for one channel at a time. It returns
//! items to the caller and never writes anything itself. Article text is a
//! separate step so the caller can leave out links it already stored.

pub mod article;
pub mod client;
pub mod feed;
pub mod retry;

pub use client::{FeedClient, HttpFeedClient};
pub use retry::{RetryClient, RetryPolicy, backoff_delay};

use crate::config::{ChannelConfig, RuntimeSettings, SourceConfig};
use crate::error::{FetchError, IngestError, ParseError};
use crate::models::{ChannelKey, RawItem};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use feed::ItemContext;
use std::collections::HashSet;
use tracing::{info, instrument};

pub struct FeedFetcher<C> {
    client: RetryClient<C>,
    timezone: Tz,
    lookback: chrono::Duration,
}

impl<C: FeedClient> FeedFetcher<C> {
    pub fn new(client: C, settings: &RuntimeSettings) -> Self {
        Self {
            client: RetryClient::new(client, RetryPolicy::from_settings(settings)),
            timezone: settings.timezone,
            lookback: settings.lookback(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        self.client.policy()
    }

    /// Fetch one channel and return at most `limit` items.
    ///
    /// Transport failures are retried per the [`RetryPolicy`]; once the budget
    /// is spent the result is a [`FetchError`]. A body that is not a readable
    /// feed is a [`ParseError`] and is not retried.
    #[instrument(level = "info", skip_all, fields(source = %source.id, channel = %channel.name, limit))]
    pub async fn fetch(
        &self,
        source: &SourceConfig,
        channel: &ChannelConfig,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawItem>, IngestError> {
        let key = ChannelKey::new(&source.id, &channel.name);

        let body = self
            .client
            .get_text(&channel.url)
            .await
            .map_err(|last| FetchError {
                channel: key.clone(),
                attempts: self.policy().max_attempts(),
                last,
            })?;

        let ctx = ItemContext {
            source: &source.id,
            channel: &channel.name,
            category: &channel.category,
            timezone: self.timezone,
            fetched_at: now.with_timezone(&self.timezone).fixed_offset(),
        };
        let items = feed::parse_items(&body, &ctx, limit).map_err(|reason| ParseError {
            channel: key.clone(),
            reason,
        })?;

        info!(channel = %key, items = items.len(), "Fetched channel");
        Ok(items)
    }

    /// Replace `raw_content` with the article text for sources that set an
    /// `article_selector`. Items whose link is in `known` are left alone, as
    /// are items published before the lookback window.
    pub async fn fill_articles(
        &self,
        source: &SourceConfig,
        items: &mut [RawItem],
        known: &HashSet<String>,
        now: DateTime<Utc>,
    ) {
        let Some(selector) = &source.article_selector else {
            return;
        };
        let window_start = (now - self.lookback).with_timezone(&self.timezone).fixed_offset();
        article::fill_article_text(self.client.inner(), items, selector, window_start, known).await;
    }
}
