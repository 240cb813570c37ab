//! Title and link canonicalization.
//!
//! `normalize_title` is idempotent: its output contains only lowercase
//! alphanumeric tokens separated by single spaces, and none of the passes
//! below can change such a string.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use url::Url;

/// Leading tokens that carry no story content.
const BOILERPLATE_PREFIXES: &[&str] = &[
    "breaking", "exclusive", "update", "updated", "updates", "live", "watch", "快訊", "獨家",
    "即時", "更新", "最新",
];

/// Trailing tokens that only describe the media type.
const MEDIA_SUFFIXES: &[&str] = &[
    "video", "videos", "photo", "photos", "gallery", "audio", "podcast", "影音", "影片", "圖輯",
    "直播",
];

/// Separators aggregators put between a headline and its publisher.
const SOURCE_SEPARATORS: &[&str] = &[" - ", " | ", " · ", " – ", " — ", "｜"];

/// Longest trailing segment still treated as a publisher name.
const MAX_SOURCE_SUFFIX_CHARS: usize = 40;

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static tag pattern"))
}

/// Canonicalize a raw feed title into its comparable form.
///
/// Never fails: empty or markup-only input yields an empty string, which
/// callers must reject before similarity checks.
pub fn normalize_title(raw: &str) -> String {
    let without_tags = tag_regex().replace_all(raw, " ");
    let decoded = decode_entities(&without_tags);
    let (headline, _) = split_source_suffix(&decoded);

    let folded: String = headline
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    let lead = tokens
        .iter()
        .take_while(|t| BOILERPLATE_PREFIXES.contains(t))
        .count();
    tokens.drain(..lead);
    while tokens.last().is_some_and(|t| MEDIA_SUFFIXES.contains(t)) {
        tokens.pop();
    }

    tokens.join(" ")
}

/// Split an aggregator-style "Headline - Publisher" title.
///
/// Returns the headline and the publisher when the trailing segment looks
/// like one (non-empty, short, and the headline itself is non-empty).
pub fn split_source_suffix(title: &str) -> (&str, Option<&str>) {
    let trimmed = title.trim();
    let split = SOURCE_SEPARATORS
        .iter()
        .filter_map(|sep| trimmed.rfind(sep).map(|idx| (idx, sep.len())))
        .max_by_key(|(idx, _)| *idx);

    if let Some((idx, sep_len)) = split {
        let head = trimmed[..idx].trim();
        let tail = trimmed[idx + sep_len..].trim();
        if !head.is_empty() && !tail.is_empty() && tail.chars().count() <= MAX_SOURCE_SUFFIX_CHARS {
            return (head, Some(tail));
        }
    }
    (trimmed, None)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Canonical form of a link: scheme and host lowercased, query and fragment
/// dropped. `None` when the link is not an absolute URL.
pub fn canonical_url(link: &str) -> Option<String> {
    let mut url = Url::parse(link.trim()).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Hex SHA-256 of a normalized title.
pub fn title_hash(normalized: &str) -> String {
    sha256_hex(normalized)
}

/// Hex SHA-256 of a canonical URL.
pub fn url_hash(canonical: &str) -> String {
    sha256_hex(canonical)
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
