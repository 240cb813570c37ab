use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::fallback::FallbackChain;
use crate::processing::RunReport;
use crate::shortener::{shorten_with, LinkShortener};

/// One surfaced item as handed to the delivery layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestItem {
    pub title: String,
    pub source: Option<String>,
    /// Canonical link
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_link: Option<String>,
    pub category: String,
    pub published_at: DateTime<Utc>,
    /// Times this story was seen in the run, including the surfaced copy
    pub occurrences: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryBucket {
    pub category: String,
    /// Newest first
    pub items: Vec<DigestItem>,
}

/// Output of one run: buckets in category-table order, catch-all last.
#[derive(Debug, Clone, Serialize)]
pub struct Digest {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub buckets: Vec<CategoryBucket>,
    pub report: RunReport,
}

impl Digest {
    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(|b| b.items.len()).sum()
    }

    pub fn bucket(&self, category: &str) -> Option<&CategoryBucket> {
        self.buckets.iter().find(|b| b.category == category)
    }

    pub fn items_mut(&mut self) -> impl Iterator<Item = &mut DigestItem> {
        self.buckets.iter_mut().flat_map(|b| b.items.iter_mut())
    }
}

/// Where a finished digest goes.
#[async_trait::async_trait]
pub trait DigestSink: Send + Sync {
    async fn deliver(&self, digest: &Digest) -> Result<()>;
}

/// Pretty JSON to a file, or to stdout when no path is set.
pub struct JsonSink {
    path: Option<PathBuf>,
}

impl JsonSink {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

#[async_trait::async_trait]
impl DigestSink for JsonSink {
    async fn deliver(&self, digest: &Digest) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(digest).context("failed to serialize digest")?;
        json.push(b'\n');
        match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                tokio::fs::write(path, &json)
                    .await
                    .with_context(|| format!("failed to write digest to {}", path.display()))?;
                info!(path = %path.display(), items = digest.item_count(), "delivery: digest written");
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&json).await.context("failed to write digest to stdout")?;
                stdout.flush().await?;
            }
        }
        Ok(())
    }
}

/// Best-effort: fill `short_link` on every item. An item whose link no
/// provider could shorten keeps `short_link = None`.
pub async fn shorten_links(digest: &mut Digest, chain: &FallbackChain<dyn LinkShortener>) {
    if chain.is_empty() {
        return;
    }
    let mut memo: HashMap<String, Option<String>> = HashMap::new();
    for item in digest.items_mut() {
        if let Some(known) = memo.get(&item.link) {
            item.short_link = known.clone();
            continue;
        }
        let short = match shorten_with(chain, &item.link).await {
            Ok(short) => Some(short),
            Err(e) => {
                debug!(link = %item.link, error = %e, "delivery: keeping long link");
                None
            }
        };
        memo.insert(item.link.clone(), short.clone());
        item.short_link = short;
    }
}
