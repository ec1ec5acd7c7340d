//! HTTP transport for feeds and article pages.
//!
//! [`FeedClient`] is the seam between the fetch logic and the network. The
//! production implementation is [`HttpFeedClient`]; tests plug in scripted
//! clients, and [`RetryClient`](super::retry::RetryClient) decorates either.

use crate::config::RuntimeSettings;
use crate::error::TransportError;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use url::Url;

/// Retrieve a document as text.
///
/// Every error is a single failed attempt; retrying is the caller's business.
/// Runs are driven on a single task, so the returned futures carry no `Send`
/// bound.
#[allow(async_fn_in_trait)]
pub trait FeedClient {
    async fn get_text(&self, url: &Url) -> Result<String, TransportError>;
}

impl<T: FeedClient> FeedClient for Arc<T> {
    async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
        (**self).get_text(url).await
    }
}

/// [`FeedClient`] backed by a shared `reqwest` client.
///
/// The timeout applies to each request as a whole (connect, headers and
/// body), so one slow attempt cannot eat the retry budget of a channel.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    client: Client,
}

impl HttpFeedClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Result<Self, reqwest::Error> {
        Self::new(&settings.user_agent, settings.request_timeout)
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

impl FeedClient for HttpFeedClient {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn get_text(&self, url: &Url) -> Result<String, TransportError> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), elapsed_ms = t0.elapsed().as_millis() as u64, "Non-success status");
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(classify)?;
        debug!(bytes = body.len(), elapsed_ms = t0.elapsed().as_millis() as u64, "Fetched");
        Ok(body)
    }
}
