//! Duplicate detection against the bounded recent window.
//!
//! Four independent signals are computed: exact title hash, exact URL hash,
//! lexical overlap (Jaccard over title tokens) and semantic similarity
//! (cosine over embeddings). A candidate is a duplicate once at least
//! `min_signals` of them fire; the default of 1 gives OR semantics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateSignal {
    TitleHash,
    UrlHash,
    Lexical,
    Semantic,
}

impl DuplicateSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateSignal::TitleHash => "title_hash",
            DuplicateSignal::UrlHash => "url_hash",
            DuplicateSignal::Lexical => "lexical",
            DuplicateSignal::Semantic => "semantic",
        }
    }
}

/// One fired signal and the record it fired against.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHit {
    pub signal: DuplicateSignal,
    pub score: f64,
    /// Title hash of the matched record
    pub matched: String,
}

#[derive(Debug, Clone, Default)]
pub struct Assessment {
    pub hits: Vec<SignalHit>,
}

impl Assessment {
    pub fn has(&self, signal: DuplicateSignal) -> bool {
        self.hits.iter().any(|h| h.signal == signal)
    }

    /// Record a hit unless the same signal already fired.
    pub fn add(&mut self, hit: SignalHit) {
        if !self.has(hit.signal) {
            self.hits.push(hit);
        }
    }

    pub fn signals(&self) -> Vec<DuplicateSignal> {
        self.hits.iter().map(|h| h.signal).collect()
    }

    /// The record the strongest evidence points at: exact matches first.
    pub fn primary_match(&self) -> Option<&str> {
        self.hits.first().map(|h| h.matched.as_str())
    }
}

/// A previously surfaced item as seen by the comparison window.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub title_hash: String,
    pub url_hash: String,
    pub normalized: String,
    pub tokens: HashSet<String>,
    pub embedding: Option<Vec<f32>>,
    pub first_seen: DateTime<Utc>,
}

impl WindowEntry {
    pub fn new(
        title_hash: String,
        url_hash: String,
        normalized: String,
        embedding: Option<Vec<f32>>,
        first_seen: DateTime<Utc>,
    ) -> Self {
        let tokens = tokenize(&normalized);
        Self { title_hash, url_hash, normalized, tokens, embedding, first_seen }
    }
}

/// Count-bounded, newest-first projection of the Dedup Store.
///
/// Title and URL hashes are indexed so the exact signals are O(1); the
/// lexical and semantic signals scan the window linearly.
#[derive(Debug, Clone)]
pub struct RunWindow {
    entries: VecDeque<WindowEntry>,
    by_title: HashMap<String, usize>,
    by_url: HashMap<String, String>,
    max_records: usize,
}

impl RunWindow {
    pub fn new(max_records: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            by_title: HashMap::new(),
            by_url: HashMap::new(),
            max_records: max_records.max(1),
        }
    }

    /// Build from records ordered newest first, keeping at most `max_records`.
    pub fn from_newest_first(entries: Vec<WindowEntry>, max_records: usize) -> Self {
        let mut window = Self::new(max_records);
        for entry in entries.into_iter().take(window.max_records) {
            window.index(&entry);
            window.entries.push_back(entry);
        }
        window
    }

    /// Add a record accepted during this run, evicting the oldest entry
    /// when the window is full.
    pub fn push(&mut self, entry: WindowEntry) {
        self.index(&entry);
        self.entries.push_front(entry);
        while self.entries.len() > self.max_records {
            if let Some(old) = self.entries.pop_back() {
                self.unindex(&old);
            }
        }
    }

    fn index(&mut self, entry: &WindowEntry) {
        *self.by_title.entry(entry.title_hash.clone()).or_insert(0) += 1;
        self.by_url
            .insert(entry.url_hash.clone(), entry.title_hash.clone());
    }

    fn unindex(&mut self, entry: &WindowEntry) {
        if let Some(count) = self.by_title.get_mut(&entry.title_hash) {
            *count -= 1;
            if *count == 0 {
                self.by_title.remove(&entry.title_hash);
            }
        }
        if self.by_url.get(&entry.url_hash) == Some(&entry.title_hash) {
            self.by_url.remove(&entry.url_hash);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }

    pub fn contains_title_hash(&self, hash: &str) -> bool {
        self.by_title.contains_key(hash)
    }

    /// Title hash of the record holding this URL hash.
    pub fn title_for_url_hash(&self, hash: &str) -> Option<&str> {
        self.by_url.get(hash).map(String::as_str)
    }
}

/// What the engine needs to know about a candidate.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub title_hash: &'a str,
    pub url_hash: &'a str,
    pub tokens: &'a HashSet<String>,
    pub embedding: Option<&'a [f32]>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub lexical: f64,
    pub semantic: f64,
    pub min_signals: usize,
}

impl Thresholds {
    pub fn new(lexical: f64, semantic: f64, min_signals: usize) -> Result<Self, ConfigError> {
        for (name, value) in [("lexical_threshold", lexical), ("semantic_threshold", semantic)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::InvalidThreshold { name, value });
            }
        }
        if !(1..=4).contains(&min_signals) {
            return Err(ConfigError::InvalidSignalCount(min_signals));
        }
        Ok(Self { lexical, semantic, min_signals })
    }
}

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    thresholds: Thresholds,
}

impl SimilarityEngine {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Evaluate every signal available for `probe`. The semantic signal is
    /// only evaluated when the probe carries an embedding.
    pub fn assess(&self, probe: &Probe<'_>, window: &RunWindow) -> Assessment {
        let mut assessment = self.assess_exact(probe, window);
        if let Some(hit) = self.lexical_hit(probe.tokens, window) {
            assessment.add(hit);
        }
        if let Some(embedding) = probe.embedding {
            if let Some(hit) = self.semantic_hit(embedding, window) {
                assessment.add(hit);
            }
        }
        assessment
    }

    pub fn is_duplicate(&self, probe: &Probe<'_>, window: &RunWindow) -> bool {
        self.verdict(&self.assess(probe, window))
    }

    /// Whether enough signals fired.
    pub fn verdict(&self, assessment: &Assessment) -> bool {
        assessment.hits.len() >= self.thresholds.min_signals
    }

    pub fn assess_exact(&self, probe: &Probe<'_>, window: &RunWindow) -> Assessment {
        let mut assessment = Assessment::default();
        if window.contains_title_hash(probe.title_hash) {
            assessment.add(SignalHit {
                signal: DuplicateSignal::TitleHash,
                score: 1.0,
                matched: probe.title_hash.to_string(),
            });
        }
        if let Some(matched) = window.title_for_url_hash(probe.url_hash) {
            assessment.add(SignalHit {
                signal: DuplicateSignal::UrlHash,
                score: 1.0,
                matched: matched.to_string(),
            });
        }
        assessment
    }

    pub fn lexical_hit(&self, tokens: &HashSet<String>, window: &RunWindow) -> Option<SignalHit> {
        best_match(window, |entry| Some(jaccard(tokens, &entry.tokens)))
            .filter(|(score, _)| *score >= self.thresholds.lexical)
            .map(|(score, matched)| SignalHit {
                signal: DuplicateSignal::Lexical,
                score,
                matched,
            })
    }

    pub fn semantic_hit(&self, embedding: &[f32], window: &RunWindow) -> Option<SignalHit> {
        best_match(window, |entry| {
            entry
                .embedding
                .as_deref()
                .and_then(|other| cosine_similarity(embedding, other))
        })
        .filter(|(score, _)| *score >= self.thresholds.semantic)
        .map(|(score, matched)| SignalHit {
            signal: DuplicateSignal::Semantic,
            score,
            matched,
        })
    }
}

/// Highest score over the window with the title hash that produced it.
fn best_match<F>(window: &RunWindow, score: F) -> Option<(f64, String)>
where
    F: Fn(&WindowEntry) -> Option<f64>,
{
    let mut best: Option<(f64, &WindowEntry)> = None;
    for entry in window.iter() {
        if let Some(s) = score(entry) {
            if best.map_or(true, |(b, _)| s > b) {
                best = Some((s, entry));
            }
        }
    }
    best.map(|(s, e)| (s, e.title_hash.clone()))
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF       // kana
        | 0x3400..=0x4DBF     // CJK ext A
        | 0x4E00..=0x9FFF     // CJK unified
        | 0xAC00..=0xD7AF     // hangul
        | 0xF900..=0xFAFF     // compatibility ideographs
        | 0x20000..=0x2A6DF)  // CJK ext B
}

/// Token set of a normalized title: words of two or more characters, with
/// unsegmented CJK runs split into overlapping character bigrams.
pub fn tokenize(normalized: &str) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for word in normalized.split_whitespace() {
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0;
        while start < chars.len() {
            let cjk = is_cjk(chars[start]);
            let mut end = start + 1;
            while end < chars.len() && is_cjk(chars[end]) == cjk {
                end += 1;
            }
            let run = &chars[start..end];
            if cjk {
                for pair in run.windows(2) {
                    tokens.insert(pair.iter().collect());
                }
            } else if run.len() >= 2 {
                tokens.insert(run.iter().collect());
            }
            start = end;
        }
    }
    tokens
}

/// |A ∩ B| / |A ∪ B|; zero when either side is empty so that a title with
/// no usable tokens never matches anything.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Cosine similarity; `None` when dimensions differ or either vector is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return None;
    }
    Some(dot / (mag_a * mag_b))
}
