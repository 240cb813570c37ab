use thiserror::Error;

/// Invalid configuration. Always fatal, raised before any item is processed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("category table has no matchable categories")]
    EmptyCategoryTable,

    #[error("catch-all category '{0}' must not declare keywords")]
    CatchAllHasKeywords(String),

    #[error("catch-all category name is empty")]
    MissingCatchAll,

    #[error("category '{0}' is declared more than once")]
    DuplicateCategory(String),

    #[error("category '{0}' has no keywords")]
    NoKeywords(String),

    #[error("category '{0}' contains an empty keyword")]
    EmptyKeyword(String),

    #[error("{name} must be in (0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("min_signals must be between 1 and 4, got {0}")]
    InvalidSignalCount(usize),

    #[error("{name} must be positive, got {value}")]
    InvalidHorizon { name: &'static str, value: i64 },

    #[error("window_max_records must be positive")]
    EmptyWindow,

    #[error("utc_offset_hours must be within -23..=23, got {0}")]
    InvalidUtcOffset(i32),

    #[error("no feeds configured")]
    NoFeeds,
}

/// Dedup Store failure. Fatal for the run: without a readable store there is
/// no way to guarantee non-duplication.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dedup store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("dedup store integrity check failed: {0}")]
    Integrity(String),

    #[error("corrupt dedup record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// The only error a pipeline run returns. Transient per-item and per-source
/// failures are logged and absorbed; they never become a `RunError`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
