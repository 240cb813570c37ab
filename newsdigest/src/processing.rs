//! One pipeline run: evict, load the window, fetch every source, then push
//! each candidate through filter, dedup, classify and persist in a single
//! serialized loop.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classify::{classify, CategoryId};
use crate::context::PipelineContext;
use crate::delivery::{CategoryBucket, Digest, DigestItem};
use crate::embedding::RunEmbedder;
use crate::error::RunError;
use crate::ingestion::{CandidateItem, FeedSource};
use crate::normalize::{canonical_url, normalize_title, title_hash, url_hash};
use crate::similarity::{tokenize, Assessment, DuplicateSignal, Probe, RunWindow, SignalHit};
use crate::storage::{DedupRecord, DedupStore, InsertGuard, InsertOutcome};

/// Terminal rejection state of a candidate item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingLink,
    MissingDate,
    EmptyTitle,
    ExcludedPrefix,
    ExcludedKeyword,
    StaleDate,
    UnapprovedSource,
    Duplicate,
    EmbeddingFailed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingLink => "missing_link",
            RejectReason::MissingDate => "missing_date",
            RejectReason::EmptyTitle => "empty_title",
            RejectReason::ExcludedPrefix => "excluded_prefix",
            RejectReason::ExcludedKeyword => "excluded_keyword",
            RejectReason::StaleDate => "stale_date",
            RejectReason::UnapprovedSource => "unapproved_source",
            RejectReason::Duplicate => "duplicate",
            RejectReason::EmbeddingFailed => "embedding_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub label: String,
    pub fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters for one run, emitted with the digest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub evicted: u64,
    pub window_size: usize,
    pub sources: Vec<SourceReport>,
    pub candidates: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    /// Items persisted this run
    pub surfaced: usize,
    /// Items in the digest; lower than `surfaced` when a category cap applies
    pub delivered: usize,
    pub semantic_degraded: bool,
}

impl RunReport {
    pub fn new(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            evicted: 0,
            window_size: 0,
            sources: Vec::new(),
            candidates: 0,
            rejected: BTreeMap::new(),
            surfaced: 0,
            delivered: 0,
            semantic_degraded: false,
        }
    }

    pub fn rejected(&self, reason: RejectReason) -> usize {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }

    fn reject(&mut self, reason: RejectReason) {
        *self.rejected.entry(reason).or_insert(0) += 1;
    }
}

enum Outcome {
    Surfaced,
    Rejected(RejectReason),
}

struct Surfaced {
    category: CategoryId,
    item: DigestItem,
}

/// Mutable state of the serialized dedup loop.
struct RunState {
    window: RunWindow,
    /// url hash -> title hash of the record it resolved to
    seen_urls: HashMap<String, String>,
    /// title hash -> index into `surfaced`
    surfaced_index: HashMap<String, usize>,
    surfaced: Vec<Surfaced>,
    embedder: Option<RunEmbedder>,
    semantic_degraded: bool,
}

impl RunState {
    /// Count another sighting of a story surfaced earlier in this run.
    fn bump_occurrence(&mut self, title_hash: &str) {
        if let Some(&idx) = self.surfaced_index.get(title_hash) {
            self.surfaced[idx].item.occurrences += 1;
        }
    }
}

/// Execute one run. Only configuration and Dedup Store failures abort it;
/// a run that surfaces nothing still returns an (empty) digest.
pub async fn run(
    ctx: &PipelineContext,
    store: &DedupStore,
    sources: &[Arc<dyn FeedSource>],
) -> Result<Digest, RunError> {
    let run_id = Uuid::new_v4().to_string();
    let mut report = RunReport::new(run_id.clone(), ctx.run_started);
    info!(run_id = %run_id, sources = sources.len(), "pipeline: run started");

    report.evicted = store.evict_older_than(ctx.retention_cutoff()).await.map_err(|e| {
        error!(run_id = %run_id, error = %e, "pipeline: eviction failed");
        e
    })?;

    let records = store.load_window(ctx.window_since(), ctx.window_max_records).await?;
    let window = RunWindow::from_newest_first(
        records.iter().map(DedupRecord::window_entry).collect(),
        ctx.window_max_records,
    );
    report.window_size = window.len();
    debug!(window = window.len(), "pipeline: loaded comparison window");

    let mut state = RunState {
        window,
        seen_urls: HashMap::new(),
        surfaced_index: HashMap::new(),
        surfaced: Vec::new(),
        embedder: ctx
            .embedder
            .clone()
            .map(|provider| RunEmbedder::new(provider, ctx.max_consecutive_failures)),
        semantic_degraded: false,
    };
    if state.embedder.is_none() {
        info!("pipeline: no embedding provider, semantic signal disabled");
    }

    for (label, fetched) in fetch_all(sources, ctx.fetch_concurrency).await {
        let items = match fetched {
            Ok(items) => items,
            Err(e) => {
                warn!(source = %label, error = %e, "pipeline: source failed, continuing");
                report.sources.push(SourceReport {
                    label,
                    fetched: 0,
                    error: Some(format!("{:#}", e)),
                });
                continue;
            }
        };
        report.sources.push(SourceReport {
            label: label.clone(),
            fetched: items.len(),
            error: None,
        });

        for item in items {
            report.candidates += 1;
            match process_item(ctx, store, &mut state, item, &label).await {
                Ok(Outcome::Surfaced) => report.surfaced += 1,
                Ok(Outcome::Rejected(reason)) => report.reject(reason),
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "pipeline: dedup store failure, aborting run");
                    return Err(e);
                }
            }
        }
    }

    report.semantic_degraded = state.semantic_degraded;
    let buckets = into_buckets(ctx, state.surfaced);
    report.delivered = buckets.iter().map(|b| b.items.len()).sum();

    info!(
        run_id = %run_id,
        candidates = report.candidates,
        surfaced = report.surfaced,
        delivered = report.delivered,
        rejected = report.rejected.values().sum::<usize>(),
        failed_sources = report.failed_sources(),
        evicted = report.evicted,
        "pipeline: run complete"
    );

    Ok(Digest {
        run_id,
        generated_at: Utc::now(),
        buckets,
        report,
    })
}

/// Fetch all sources with bounded concurrency. Results come back in
/// declared source order.
async fn fetch_all(
    sources: &[Arc<dyn FeedSource>],
    concurrency: usize,
) -> Vec<(String, Result<Vec<CandidateItem>>)> {
    stream::iter(sources.iter().cloned())
        .map(|source| async move {
            let label = source.label().to_string();
            let fetched = source.fetch().await;
            (label, fetched)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}

async fn process_item(
    ctx: &PipelineContext,
    store: &DedupStore,
    state: &mut RunState,
    item: CandidateItem,
    source_label: &str,
) -> Result<Outcome, RunError> {
    let reject = |reason: RejectReason, title: &str| -> Result<Outcome, RunError> {
        debug!(source = %source_label, title = %title, reason = %reason, "pipeline: item rejected");
        Ok(Outcome::Rejected(reason))
    };

    let Some(canonical) = item.link.as_deref().and_then(canonical_url) else {
        return reject(RejectReason::MissingLink, &item.title);
    };
    let Some(published) = item.published else {
        return reject(RejectReason::MissingDate, &item.title);
    };

    let normalized = normalize_title(&item.title);
    if normalized.is_empty() {
        return reject(RejectReason::EmptyTitle, &item.title);
    }
    if ctx.filters.has_excluded_prefix(&item.title) {
        return reject(RejectReason::ExcludedPrefix, &item.title);
    }
    if ctx.filters.excluded_keyword(&item.title).is_some() {
        return reject(RejectReason::ExcludedKeyword, &item.title);
    }
    if !ctx.recency.is_fresh(published, ctx.run_started) {
        return reject(RejectReason::StaleDate, &item.title);
    }
    if !ctx.filters.is_source_allowed(item.source.as_deref(), &item.title) {
        return reject(RejectReason::UnapprovedSource, &item.title);
    }

    let t_hash = title_hash(&normalized);
    let u_hash = url_hash(&canonical);

    // Same resource already handled in this run
    if let Some(matched) = state.seen_urls.get(&u_hash).cloned() {
        state.bump_occurrence(&matched);
        debug!(url = %canonical, "pipeline: link already seen this run");
        return reject(RejectReason::Duplicate, &item.title);
    }

    let tokens = tokenize(&normalized);
    let probe = Probe {
        title_hash: &t_hash,
        url_hash: &u_hash,
        tokens: &tokens,
        embedding: None,
    };
    let mut assessment = ctx.engine.assess_exact(&probe, &state.window);
    if !ctx.engine.verdict(&assessment) {
        exact_store_hits(store, &t_hash, &u_hash, &mut assessment).await?;
    }
    if !ctx.engine.verdict(&assessment) {
        if let Some(hit) = ctx.engine.lexical_hit(&tokens, &state.window) {
            assessment.add(hit);
        }
    }

    let mut embedding = None;
    if !ctx.engine.verdict(&assessment) {
        if let Some(embedder) = state.embedder.as_mut().filter(|e| e.is_available()) {
            match embedder.embed(&normalized).await {
                Ok(vector) => {
                    if let Some(hit) = ctx.engine.semantic_hit(&vector, &state.window) {
                        assessment.add(hit);
                    }
                    embedding = Some(vector.as_ref().clone());
                }
                Err(e) => {
                    warn!(url = %canonical, error = %e, "pipeline: embedding failed, dropping item");
                    if !embedder.is_available() && !state.semantic_degraded {
                        warn!(
                            model = %embedder.model(),
                            "pipeline: embedding provider unavailable, continuing without semantic signal"
                        );
                        state.semantic_degraded = true;
                    }
                    return Ok(Outcome::Rejected(RejectReason::EmbeddingFailed));
                }
            }
        }
    }

    if ctx.engine.verdict(&assessment) {
        let matched = assessment.primary_match().unwrap_or(t_hash.as_str()).to_string();
        let signals: Vec<&str> = assessment.signals().iter().map(|s| s.as_str()).collect();
        debug!(
            url = %canonical,
            signals = ?signals,
            "pipeline: duplicate"
        );
        state.seen_urls.insert(u_hash, matched.clone());
        state.bump_occurrence(&matched);
        return reject(RejectReason::Duplicate, &item.title);
    }

    let input = ctx.table.classifier_input(&normalized, item.body.as_deref());
    let category = classify(&input, &ctx.table);
    let category_name = ctx.table.name(category).to_string();

    let record = DedupRecord {
        record_key: DedupRecord::key_for(&t_hash, ctx.run_started),
        normalized_title: normalized,
        canonical_url: canonical.clone(),
        title_hash: t_hash.clone(),
        url_hash: u_hash.clone(),
        embedding,
        category: category_name.clone(),
        title: item.title.clone(),
        source: item.source.clone(),
        published_at: published,
        first_seen_at: ctx.run_started,
    };

    let guard = InsertGuard::for_min_signals(ctx.engine.thresholds().min_signals);
    if store.insert_if_absent(&record, guard).await? == InsertOutcome::AlreadyPresent {
        // Admitted concurrently by an overlapping run
        debug!(url = %canonical, "pipeline: record appeared in store before insert");
        state.seen_urls.insert(u_hash, t_hash);
        return reject(RejectReason::Duplicate, &item.title);
    }

    state.window.push(record.window_entry());
    state.seen_urls.insert(u_hash, t_hash.clone());
    state.surfaced_index.insert(t_hash, state.surfaced.len());
    state.surfaced.push(Surfaced {
        category,
        item: DigestItem {
            title: record.title,
            source: record.source,
            link: canonical,
            short_link: None,
            category: category_name.clone(),
            published_at: published,
            occurrences: 1,
        },
    });
    debug!(category = %category_name, source = %source_label, "pipeline: item surfaced");
    Ok(Outcome::Surfaced)
}

/// Exact-hash lookups against the whole store, for records older than
/// the in-memory window.
async fn exact_store_hits(
    store: &DedupStore,
    t_hash: &str,
    u_hash: &str,
    assessment: &mut Assessment,
) -> Result<(), RunError> {
    if !assessment.has(DuplicateSignal::TitleHash) {
        if let Some(record) = store.find_by_title_hash(t_hash).await? {
            assessment.add(SignalHit {
                signal: DuplicateSignal::TitleHash,
                score: 1.0,
                matched: record.title_hash,
            });
        }
    }
    if !assessment.has(DuplicateSignal::UrlHash) {
        if let Some(record) = store.find_by_url_hash(u_hash).await? {
            assessment.add(SignalHit {
                signal: DuplicateSignal::UrlHash,
                score: 1.0,
                matched: record.title_hash,
            });
        }
    }
    Ok(())
}

/// Group surfaced items by category in table order, newest first. When a
/// per-category cap is set the most-seen stories are kept.
fn into_buckets(ctx: &PipelineContext, surfaced: Vec<Surfaced>) -> Vec<CategoryBucket> {
    let mut grouped: Vec<Vec<DigestItem>> = ctx.table.ids().map(|_| Vec::new()).collect();
    for s in surfaced {
        grouped[s.category.0].push(s.item);
    }

    ctx.table
        .ids()
        .zip(grouped)
        .map(|(id, mut items)| {
            if let Some(cap) = ctx.max_items_per_category {
                if items.len() > cap {
                    items.sort_by(|a, b| {
                        b.occurrences
                            .cmp(&a.occurrences)
                            .then(b.published_at.cmp(&a.published_at))
                    });
                    let dropped = items.len() - cap;
                    items.truncate(cap);
                    debug!(category = %ctx.table.name(id), dropped, "pipeline: category cap applied");
                }
            }
            items.sort_by(|a, b| {
                b.published_at
                    .cmp(&a.published_at)
                    .then_with(|| a.title.cmp(&b.title))
            });
            CategoryBucket {
                category: ctx.table.name(id).to_string(),
                items,
            }
        })
        .collect()
}
