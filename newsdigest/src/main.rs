/*
newsdigest - single-run binary
Fetches the configured feeds once, drops anything already surfaced, classifies
the rest and writes the digest. Meant to be triggered by cron or a timer.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::{init_db_pool, Config, EmbeddingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newsdigest::context::PipelineContext;
use newsdigest::delivery::{shorten_links, DigestSink, JsonSink};
use newsdigest::embedding::remote::RemoteEmbeddingProvider;
use newsdigest::embedding::EmbeddingProvider;
use newsdigest::error::ConfigError;
use newsdigest::ingestion::{FeedSource, HttpFeedSource};
use newsdigest::processing;
use newsdigest::shortener;
use newsdigest::storage::DedupStore;

#[derive(Parser, Debug)]
#[command(name = "newsdigest", about = "Deduplicate and classify news feeds into a digest")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write the digest here instead of the configured output
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Skip link shortening
    #[arg(long)]
    no_shorten: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = load_config(args.config).await?;

    // Validate everything before touching the store or the network
    let embedder = build_embedder(config.embedding.as_ref());
    let ctx = match PipelineContext::from_config(&config, embedder, Utc::now()) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(%e, "invalid configuration");
            return Err(e.into());
        }
    };
    if config.feeds.is_empty() {
        error!("invalid configuration: {}", ConfigError::NoFeeds);
        return Err(ConfigError::NoFeeds.into());
    }

    // Initialize DB pool - resolve and log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let db_pool = match init_db_pool(&db_path_abs).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
            return Err(e);
        }
    };
    let store = match DedupStore::open(db_pool).await {
        Ok(store) => store,
        Err(e) => {
            error!(%e, db_path = %db_path_abs, "dedup store unusable");
            return Err(e.into());
        }
    };

    let timeout = config.fetch_timeout_seconds();
    let sources: Vec<Arc<dyn FeedSource>> = config
        .feeds
        .iter()
        .map(|feed| Arc::new(HttpFeedSource::new(&feed.url, feed.label.clone(), timeout)) as Arc<dyn FeedSource>)
        .collect();

    // A fatal run error is returned before any digest is written
    let mut digest = processing::run(&ctx, &store, &sources).await?;

    if !args.no_shorten {
        if let Some(shortener_cfg) = &config.shortener {
            let chain = shortener::build_chain(shortener_cfg);
            shorten_links(&mut digest, &chain).await;
        }
    }

    let output = args.output.or_else(|| config.output.path.as_ref().map(PathBuf::from));
    JsonSink::new(output)
        .deliver(&digest)
        .await
        .context("failed to deliver digest")?;

    for bucket in &digest.buckets {
        info!(category = %bucket.category, items = bucket.items.len(), "digest bucket");
    }
    info!(
        run_id = %digest.run_id,
        items = digest.item_count(),
        rejected = digest.report.rejected.values().sum::<usize>(),
        "run finished"
    );
    Ok(())
}

/// config.default.toml merged under config.toml (or the file given with --config).
async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = explicit {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

/// Build the embedding provider. A missing section or a missing API key
/// leaves the run in non-semantic mode rather than failing it.
fn build_embedder(cfg: Option<&EmbeddingConfig>) -> Option<Arc<dyn EmbeddingProvider>> {
    let cfg = cfg?;
    let mut provider = RemoteEmbeddingProvider::new(&cfg.api_url, &cfg.model);
    if let Some(secs) = cfg.timeout_seconds {
        provider = provider.with_timeout(secs);
    }
    if let Some(env) = cfg.api_key_env.as_deref() {
        match std::env::var(env) {
            Ok(key) => provider = provider.with_api_key(key),
            Err(_) => {
                warn!(env = %env, "embedding API key env var not set, semantic signal disabled");
                return None;
            }
        }
    }
    info!(model = %cfg.model, endpoint = %provider.endpoint(), "embedding provider initialized");
    Some(Arc::new(provider))
}
