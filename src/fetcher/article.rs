//! Full-text retrieval for fresh items.
//!
//! Sources that configure an `article_selector` get the body of each recent,
//! not yet stored article downloaded and reduced to plain text. This is best effort: a page
//! that fails to load or has no matching element leaves the item as the feed
//! described it.

use super::client::FeedClient;
use crate::models::RawItem;
use chrono::{DateTime, FixedOffset};
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Article pages downloaded at the same time for one channel.
const ARTICLE_CONCURRENCY: usize = 4;

/// Extract readable text from `html`.
///
/// Paragraphs (`<p>`) under the first element matching `selector` are joined
/// with spaces. When the element holds no paragraphs its whole text is used.
/// Returns `None` when nothing matches or the result is blank.
pub fn extract_article_text(html: &str, selector: &Selector) -> Option<String> {
    let document = Html::parse_document(html);
    let body = document.select(selector).next()?;
    let paragraph = Selector::parse("p").ok()?;

    let paragraphs: Vec<String> = body
        .select(&paragraph)
        .map(|p| normalize_ws(&p.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .collect();

    let text = if paragraphs.is_empty() {
        normalize_ws(&body.text().collect::<Vec<_>>().join(" "))
    } else {
        paragraphs.join(" ")
    };
    (!text.is_empty()).then_some(text)
}

fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fill `raw_content` for items published at or after `window_start`
/// (undated items included) whose link is not in `known`. One attempt per
/// page.
#[instrument(level = "info", skip_all, fields(items = items.len(), %selector))]
pub async fn fill_article_text<C: FeedClient>(
    client: &C,
    items: &mut [RawItem],
    selector: &str,
    window_start: DateTime<FixedOffset>,
    known: &HashSet<String>,
) {
    let selector = match Selector::parse(selector) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Invalid article selector; skipping full text");
            return;
        }
    };

    let wanted: Vec<(usize, Url)> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.published_at.is_none_or(|p| p >= window_start))
        .filter(|(_, item)| !known.contains(&item.link))
        .filter_map(|(i, item)| Url::parse(&item.link).ok().map(|u| (i, u)))
        .collect();

    let pages: Vec<(usize, Option<String>)> = stream::iter(wanted)
        .map(|(i, url)| async move {
            match client.get_text(&url).await {
                Ok(html) => (i, Some(html)),
                Err(e) => {
                    warn!(%url, error = %e, "Article fetch failed");
                    (i, None)
                }
            }
        })
        .buffer_unordered(ARTICLE_CONCURRENCY)
        .collect()
        .await;

    let mut filled = 0usize;
    for (i, html) in pages {
        let Some(html) = html else { continue };
        match extract_article_text(&html, &selector) {
            Some(text) => {
                items[i].raw_content = text;
                filled += 1;
            }
            None => debug!(link = %items[i].link, "No article body found"),
        }
    }
    info!(filled, "Article text extracted");
}
