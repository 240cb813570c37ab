use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Feed};
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::normalize::split_source_suffix;

/// Longest body excerpt kept per item, in characters.
const BODY_EXCERPT_CHARS: usize = 500;

/// One raw feed entry as seen by the pipeline. Optional fields stay
/// optional here; the pipeline decides what a missing value means.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateItem {
    pub title: String,
    pub link: Option<String>,
    pub source: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub body: Option<String>,
}

impl CandidateItem {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: Some(link.into()),
            source: None,
            published: None,
            body: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Anything that yields candidate items for a run.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    fn label(&self) -> &str;
    async fn fetch(&self) -> Result<Vec<CandidateItem>>;
}

/// RSS/Atom feed fetched over HTTP.
pub struct HttpFeedSource {
    url: String,
    label: Option<String>,
    timeout_secs: u64,
}

impl HttpFeedSource {
    pub fn new(url: impl Into<String>, label: Option<String>, timeout_secs: u64) -> Self {
        Self {
            url: url.into(),
            label,
            timeout_secs,
        }
    }
}

#[async_trait::async_trait]
impl FeedSource for HttpFeedSource {
    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.url)
    }

    async fn fetch(&self) -> Result<Vec<CandidateItem>> {
        let feed = fetch_and_parse_feed(&self.url, self.timeout_secs).await?;
        info!(source = %self.label(), entries = feed.entries.len(), "ingestion: fetched feed");
        Ok(feed
            .entries
            .iter()
            .map(|entry| candidate_from_entry(entry, self.label.as_deref()))
            .collect())
    }
}

/// Convert a parsed entry. The publisher comes from an aggregator-style
/// " - Publisher" title suffix when present, else from the feed's label.
/// The timestamp is the entry's `published`, else its `updated`; never
/// the fetch time.
pub fn candidate_from_entry(entry: &Entry, feed_label: Option<&str>) -> CandidateItem {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();
    let link = entry
        .links
        .first()
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty());
    let source = split_source_suffix(&title)
        .1
        .map(str::to_string)
        .or_else(|| feed_label.map(str::to_string));

    let published = entry.published.or(entry.updated);
    if entry.published.is_none() && published.is_some() {
        debug!(title = %title, "ingestion: using updated timestamp in place of published");
    }

    let body = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .and_then(|html| body_excerpt(&html));

    CandidateItem {
        title,
        link,
        source,
        published,
        body,
    }
}

/// Plain-text excerpt of an HTML body; `None` when nothing readable remains.
fn body_excerpt(html: &str) -> Option<String> {
    let text = match html2text::from_read(html.as_bytes(), 200) {
        Ok(text) => text,
        Err(e) => {
            warn!("ingestion: failed to convert body HTML to text: {}", e);
            return None;
        }
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(BODY_EXCERPT_CHARS).collect())
}

/// Fetches a feed from the given URL and parses it.
/// Retries with exponential backoff on network errors, 5xx and 429; other
/// client errors are treated as permanent.
pub async fn fetch_and_parse_feed(url: &str, timeout_secs: u64) -> Result<Feed> {
    let client = Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent("newsdigest/0.1.0")
        .build()
        .context("failed to build reqwest client")?;

    let max_retries = 3;
    let mut last_error = None;

    for attempt in 1..=max_retries {
        if attempt > 1 {
            let backoff = Duration::from_secs(2u64.pow(attempt - 2)); // 1s, 2s
            info!("Retrying feed fetch for {} (attempt {}/{}) after {:?}...", url, attempt, max_retries, backoff);
            tokio::time::sleep(backoff).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    let bytes = response.bytes().await.context("failed to read response body")?;
                    let feed = parser::parse(bytes.as_ref()).context("failed to parse feed")?;
                    return Ok(feed);
                } else if status.is_server_error() {
                    last_error = Some(anyhow::anyhow!("server error: {}", status));
                } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    last_error = Some(anyhow::anyhow!("rate limited: {}", status));
                } else {
                    return Err(anyhow::anyhow!("feed fetch failed with status: {}", status));
                }
            }
            Err(e) => {
                last_error = Some(anyhow::Error::new(e).context("network error during fetch"));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")))
}
