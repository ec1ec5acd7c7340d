//! Feed document parsing (RSS 0.9x/1.0/2.0, Atom, JSON Feed via `feed-rs`).

use crate::models::RawItem;
use crate::utils::extract_news_id;
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use feed_rs::model::Entry;
use feed_rs::parser;
use itertools::Itertools;
use tracing::debug;

/// Values stamped onto every item parsed from one channel.
#[derive(Debug, Clone)]
pub struct ItemContext<'a> {
    pub source: &'a str,
    pub channel: &'a str,
    pub category: &'a str,
    pub timezone: Tz,
    pub fetched_at: DateTime<FixedOffset>,
}

/// Parse `body` and return at most `limit` items in feed order.
///
/// Entries without a link or title are dropped, and a link that appears
/// more than once in the same document is kept only the first time.
/// Anything `feed-rs` cannot read is reported as an error string.
pub fn parse_items(body: &str, ctx: &ItemContext<'_>, limit: usize) -> Result<Vec<RawItem>, String> {
    let feed = parser::parse(body.as_bytes()).map_err(|e| e.to_string())?;
    let total = feed.entries.len();

    let items: Vec<RawItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| to_raw_item(entry, ctx))
        .unique_by(|item| item.link.clone())
        .take(limit)
        .collect();

    debug!(
        source = ctx.source,
        channel = ctx.channel,
        entries = total,
        kept = items.len(),
        limit,
        "Parsed feed"
    );
    Ok(items)
}

fn to_raw_item(entry: Entry, ctx: &ItemContext<'_>) -> Option<RawItem> {
    let link = entry
        .links
        .first()
        .map(|l| l.href.trim().to_string())
        .filter(|l| !l.is_empty());
    let Some(link) = link else {
        debug!(id = %entry.id, "Skipping entry without link");
        return None;
    };
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());
    let Some(title) = title else {
        debug!(%link, "Skipping entry without title");
        return None;
    };

    let published_at = entry
        .published
        .or(entry.updated)
        .map(|dt| dt.with_timezone(&ctx.timezone).fixed_offset());

    Some(RawItem {
        news_id: extract_news_id(&link),
        title,
        link,
        published_at,
        source: ctx.source.to_string(),
        channel: ctx.channel.to_string(),
        category: ctx.category.to_string(),
        summary: entry
            .summary
            .map(|s| s.content.trim().to_string())
            .filter(|s| !s.is_empty()),
        raw_content: entry.content.and_then(|c| c.body).unwrap_or_default(),
        fetched_at: ctx.fetched_at,
    })
}
