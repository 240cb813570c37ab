use common::Config;
use newsdigest::ingestion::{FeedSource, HttpFeedSource};
use newsdigest::normalize::{canonical_url, normalize_title};
use std::path::PathBuf;

/// Fetch every configured feed once and print what the pipeline would see.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let default_path = PathBuf::from("config.default.toml");
    let config = Config::load_with_defaults(
        if default_path.exists() { Some(default_path.as_path()) } else { None },
        config_path.as_deref(),
    )
    .await?;

    for feed in &config.feeds {
        let source = HttpFeedSource::new(&feed.url, feed.label.clone(), config.fetch_timeout_seconds());
        println!("\n{}", "=".repeat(60));
        println!("Testing: {}", source.label());
        println!("{}", "=".repeat(60));

        match source.fetch().await {
            Ok(items) => {
                println!("✓ Success!");
                println!("  Entries: {}", items.len());

                if !items.is_empty() {
                    println!("\n  First 3 entries:");
                    for (i, item) in items.iter().take(3).enumerate() {
                        println!("    {}. {}", i + 1, item.title);
                        println!("       Normalized: {}", normalize_title(&item.title));
                        println!(
                            "       URL: {}",
                            item.link.as_deref().and_then(canonical_url).unwrap_or_else(|| "none".into())
                        );
                        println!("       Source: {}", item.source.as_deref().unwrap_or("unlabeled"));
                        println!(
                            "       Published: {}",
                            item.published.map(|d| d.to_rfc3339()).unwrap_or_else(|| "missing".into())
                        );
                        println!(
                            "       Body: {} chars",
                            item.body.as_ref().map(|b| b.chars().count()).unwrap_or(0)
                        );
                    }
                }
            }
            Err(e) => {
                println!("✗ Failed: {:#}", e);
            }
        }
    }
    Ok(())
}
