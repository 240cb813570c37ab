//! Everything one run needs, built once from configuration and passed by
//! reference to each stage. Nothing here outlives the run.

use chrono::{DateTime, Duration, FixedOffset, Utc};
use common::{Config, FilterConfig, RecencyMode};
use std::sync::Arc;

use crate::classify::CategoryTable;
use crate::embedding::EmbeddingProvider;
use crate::error::ConfigError;
use crate::similarity::{SimilarityEngine, Thresholds};

const DEFAULT_MAX_CONSECUTIVE_FAILURES: usize = 3;

/// How "recent enough" is decided for a publication timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecencyPolicy {
    /// Published within the last `hours` hours of the run start.
    Rolling { hours: i64 },
    /// Published on the same calendar date as the run start, in `offset`.
    CalendarDay { offset: FixedOffset },
}

impl RecencyPolicy {
    pub fn from_config(cfg: &common::RecencyConfig) -> Result<Self, ConfigError> {
        match cfg.mode {
            RecencyMode::Rolling => {
                if cfg.hours <= 0 {
                    return Err(ConfigError::InvalidHorizon {
                        name: "recency.hours",
                        value: cfg.hours,
                    });
                }
                Ok(RecencyPolicy::Rolling { hours: cfg.hours })
            }
            RecencyMode::CalendarDay => {
                if !(-23..=23).contains(&cfg.utc_offset_hours) {
                    return Err(ConfigError::InvalidUtcOffset(cfg.utc_offset_hours));
                }
                let offset = FixedOffset::east_opt(cfg.utc_offset_hours * 3600)
                    .ok_or(ConfigError::InvalidUtcOffset(cfg.utc_offset_hours))?;
                Ok(RecencyPolicy::CalendarDay { offset })
            }
        }
    }

    pub fn is_fresh(&self, published: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            RecencyPolicy::Rolling { hours } => published >= now - Duration::hours(*hours),
            RecencyPolicy::CalendarDay { offset } => {
                published.with_timezone(offset).date_naive() == now.with_timezone(offset).date_naive()
            }
        }
    }
}

/// Cheap exclusion filters. Matching is case-insensitive on substrings,
/// except title prefixes which match the start of the trimmed title.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    excluded_keywords: Vec<String>,
    excluded_title_prefixes: Vec<String>,
    allowed_sources: Vec<String>,
}

impl Filters {
    pub fn from_config(cfg: &FilterConfig) -> Self {
        fn lowered(list: &[String]) -> Vec<String> {
            list.iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        }
        Self {
            excluded_keywords: lowered(&cfg.excluded_keywords),
            excluded_title_prefixes: lowered(&cfg.excluded_title_prefixes),
            allowed_sources: lowered(&cfg.allowed_sources),
        }
    }

    pub fn has_excluded_prefix(&self, title: &str) -> bool {
        let title = title.trim_start().to_lowercase();
        self.excluded_title_prefixes.iter().any(|p| title.starts_with(p.as_str()))
    }

    pub fn excluded_keyword(&self, title: &str) -> Option<&str> {
        let title = title.to_lowercase();
        self.excluded_keywords
            .iter()
            .find(|kw| title.contains(kw.as_str()))
            .map(String::as_str)
    }

    /// An empty allow-list admits every source. Otherwise an allowed name
    /// must appear in the source label or, for aggregator items whose label
    /// was lost, in the title.
    pub fn is_source_allowed(&self, source: Option<&str>, title: &str) -> bool {
        if self.allowed_sources.is_empty() {
            return true;
        }
        let source = source.map(str::to_lowercase).unwrap_or_default();
        let title = title.to_lowercase();
        self.allowed_sources
            .iter()
            .any(|allowed| source.contains(allowed.as_str()) || title.contains(allowed.as_str()))
    }
}

/// Per-run pipeline context.
pub struct PipelineContext {
    pub run_started: DateTime<Utc>,
    pub table: CategoryTable,
    pub engine: SimilarityEngine,
    pub recency: RecencyPolicy,
    pub filters: Filters,
    pub retention: Duration,
    pub window_horizon: Duration,
    pub window_max_records: usize,
    pub max_items_per_category: Option<usize>,
    pub fetch_concurrency: usize,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub max_consecutive_failures: usize,
}

impl PipelineContext {
    /// Validate configuration and build the context. Any `ConfigError` here
    /// is fatal before the first item is looked at.
    pub fn from_config(
        config: &Config,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        run_started: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let pipeline = &config.pipeline;
        let table = CategoryTable::from_config(&config.classification)?;
        let thresholds = Thresholds::new(
            pipeline.lexical_threshold,
            pipeline.semantic_threshold,
            pipeline.min_signals,
        )?;
        for (name, value) in [
            ("retention_hours", pipeline.retention_hours),
            ("window_hours", pipeline.window_hours),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidHorizon { name, value });
            }
        }
        if pipeline.window_max_records == 0 {
            return Err(ConfigError::EmptyWindow);
        }

        let max_consecutive_failures = config
            .embedding
            .as_ref()
            .and_then(|e| e.max_consecutive_failures)
            .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES);

        Ok(Self {
            run_started,
            table,
            engine: SimilarityEngine::new(thresholds),
            recency: RecencyPolicy::from_config(&pipeline.recency)?,
            filters: Filters::from_config(&config.filters),
            retention: Duration::hours(pipeline.retention_hours),
            window_horizon: Duration::hours(pipeline.window_hours),
            window_max_records: pipeline.window_max_records,
            max_items_per_category: pipeline.max_items_per_category.filter(|n| *n > 0),
            fetch_concurrency: config.fetch_concurrency(),
            embedder,
            max_consecutive_failures,
        })
    }

    pub fn retention_cutoff(&self) -> DateTime<Utc> {
        self.run_started - self.retention
    }

    pub fn window_since(&self) -> DateTime<Utc> {
        self.run_started - self.window_horizon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(extra: &str) -> Config {
        let text = format!(
            r#"
[database]
path = "data/test.db"

[[feeds]]
url = "https://news.example.com/rss"

[classification]
catch_all = "Other"

[[classification.categories]]
name = "Banking"
keywords = ["bank", "金控"]
{}
"#,
            extra
        );
        toml::from_str(&text).expect("test config")
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn rolling_window_counts_hours_back_from_run_start() {
        let policy = RecencyPolicy::Rolling { hours: 24 };
        let now = at(2025, 1, 15, 1, 0);
        assert!(policy.is_fresh(at(2025, 1, 14, 2, 0), now));
        assert!(policy.is_fresh(at(2025, 1, 14, 1, 0), now));
        assert!(!policy.is_fresh(at(2025, 1, 14, 0, 59), now));
    }

    #[test]
    fn calendar_day_uses_the_configured_offset() {
        let taipei = RecencyPolicy::CalendarDay {
            offset: FixedOffset::east_opt(8 * 3600).unwrap(),
        };
        // 2025-01-15 01:00 UTC is 09:00 in UTC+8
        let now = at(2025, 1, 15, 1, 0);
        // 2025-01-14 16:30 UTC is 00:30 on the 15th in UTC+8
        assert!(taipei.is_fresh(at(2025, 1, 14, 16, 30), now));
        // An hour earlier is still the 14th locally, though only ~9h old
        assert!(!taipei.is_fresh(at(2025, 1, 14, 15, 30), now));

        let utc = RecencyPolicy::CalendarDay {
            offset: FixedOffset::east_opt(0).unwrap(),
        };
        assert!(!utc.is_fresh(at(2025, 1, 14, 16, 30), now));
    }

    #[test]
    fn filters_are_case_insensitive() {
        let filters = Filters::from_config(&FilterConfig {
            excluded_keywords: vec!["Sponsored".into()],
            excluded_title_prefixes: vec!["Google ニュース".into()],
            allowed_sources: vec!["經濟日報".into(), "Reuters".into()],
        });
        assert_eq!(filters.excluded_keyword("SPONSORED: card offer"), Some("sponsored"));
        assert!(filters.excluded_keyword("Bank results").is_none());
        assert!(filters.has_excluded_prefix("  Google ニュース - ビジネス"));
        assert!(!filters.has_excluded_prefix("Not Google ニュース"));
        assert!(filters.is_source_allowed(Some("reuters.com"), "x"));
        assert!(filters.is_source_allowed(None, "新光金控獲利 經濟日報"));
        assert!(!filters.is_source_allowed(Some("Blog"), "x"));
        assert!(Filters::default().is_source_allowed(None, "anything"));
    }

    #[test]
    fn builds_context_from_defaults() {
        let now = at(2025, 1, 15, 1, 0);
        let ctx = PipelineContext::from_config(&config(""), None, now).unwrap();
        assert_eq!(ctx.table.ids().count(), 2);
        assert_eq!(ctx.recency, RecencyPolicy::Rolling { hours: 24 });
        assert_eq!(ctx.retention_cutoff(), now - Duration::hours(72));
        assert_eq!(ctx.max_consecutive_failures, 3);
        assert!(ctx.embedder.is_none());
    }

    #[test]
    fn rejects_invalid_configuration() {
        let now = Utc::now();
        let bad_threshold = config("[pipeline]\nlexical_threshold = 1.5\n");
        assert!(matches!(
            PipelineContext::from_config(&bad_threshold, None, now),
            Err(ConfigError::InvalidThreshold { name: "lexical_threshold", .. })
        ));

        let bad_retention = config("[pipeline]\nretention_hours = 0\n");
        assert!(matches!(
            PipelineContext::from_config(&bad_retention, None, now),
            Err(ConfigError::InvalidHorizon { name: "retention_hours", .. })
        ));

        let bad_window = config("[pipeline]\nwindow_max_records = 0\n");
        assert!(matches!(
            PipelineContext::from_config(&bad_window, None, now),
            Err(ConfigError::EmptyWindow)
        ));

        let bad_offset = config("[pipeline.recency]\nmode = \"calendar_day\"\nutc_offset_hours = 30\n");
        assert!(matches!(
            PipelineContext::from_config(&bad_offset, None, now),
            Err(ConfigError::InvalidUtcOffset(30))
        ));

        let bad_signals = config("[pipeline]\nmin_signals = 5\n");
        assert!(matches!(
            PipelineContext::from_config(&bad_signals, None, now),
            Err(ConfigError::InvalidSignalCount(5))
        ));
    }
}
