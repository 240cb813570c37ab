use anyhow::{Context, Result};
use common::{ShortenerConfig, ShortenerKind};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::fallback::FallbackChain;

const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Turns a long link into a short one.
#[async_trait::async_trait]
pub trait LinkShortener: Send + Sync {
    fn name(&self) -> &str;
    async fn shorten(&self, url: &str) -> Result<String>;
}

/// tinyurl.com `api-create.php`, which answers with the short link as plain text.
pub struct TinyUrlShortener {
    base_url: String,
    client: Client,
}

impl TinyUrlShortener {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url.unwrap_or("https://tinyurl.com").trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LinkShortener for TinyUrlShortener {
    fn name(&self) -> &str {
        "tinyurl"
    }

    async fn shorten(&self, url: &str) -> Result<String> {
        let endpoint = Url::parse_with_params(&format!("{}/api-create.php", self.base_url), &[("url", url)])
            .context("invalid tinyurl endpoint")?;
        plain_text_get(&self.client, endpoint).await
    }
}

/// is.gd `create.php` with `format=simple`.
pub struct IsGdShortener {
    base_url: String,
    client: Client,
}

impl IsGdShortener {
    pub fn new(base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url.unwrap_or("https://is.gd").trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl LinkShortener for IsGdShortener {
    fn name(&self) -> &str {
        "isgd"
    }

    async fn shorten(&self, url: &str) -> Result<String> {
        let endpoint = Url::parse_with_params(
            &format!("{}/create.php", self.base_url),
            &[("format", "simple"), ("url", url)],
        )
        .context("invalid is.gd endpoint")?;
        plain_text_get(&self.client, endpoint).await
    }
}

async fn plain_text_get(client: &Client, endpoint: Url) -> Result<String> {
    let response = client.get(endpoint).send().await.context("shortener request failed")?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("shortener returned status {}", status);
    }
    let body = response.text().await.context("failed to read shortener response")?;
    let short = body.trim();
    if !short.starts_with("http") {
        anyhow::bail!("shortener returned an unexpected body: {}", short);
    }
    Ok(short.to_string())
}

/// Build the configured shorteners in declared order.
pub fn build_chain(cfg: &ShortenerConfig) -> FallbackChain<dyn LinkShortener> {
    cfg.providers.iter().fold(FallbackChain::new(), |chain, provider| {
        let timeout = Duration::from_secs(provider.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let base = provider.base_url.as_deref();
        let shortener: Arc<dyn LinkShortener> = match provider.kind {
            ShortenerKind::Tinyurl => Arc::new(TinyUrlShortener::new(base)),
            ShortenerKind::Isgd => Arc::new(IsGdShortener::new(base)),
        };
        let label = shortener.name().to_string();
        chain.push(label, shortener, timeout)
    })
}

/// Shorten `url` with the first provider that succeeds.
pub async fn shorten_with(chain: &FallbackChain<dyn LinkShortener>, url: &str) -> Result<String> {
    chain
        .first_success(|s| {
            let url = url.to_string();
            async move { s.shorten(&url).await }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ShortenerProviderConfig;
    use mockito::Matcher;

    #[tokio::test]
    async fn tinyurl_returns_plain_text_link() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api-create.php")
            .match_query(Matcher::UrlEncoded("url".into(), "https://news.example.com/a/1".into()))
            .with_status(200)
            .with_body("https://tinyurl.com/abc123\n")
            .create_async()
            .await;

        let shortener = TinyUrlShortener::new(Some(server.url().as_str()));
        let short = shortener.shorten("https://news.example.com/a/1").await.unwrap();
        assert_eq!(short, "https://tinyurl.com/abc123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn chain_falls_back_to_isgd_when_tinyurl_fails() {
        let mut server = mockito::Server::new_async().await;
        let _tiny = server
            .mock("GET", "/api-create.php")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;
        let _isgd = server
            .mock("GET", "/create.php")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("format".into(), "simple".into()),
                Matcher::UrlEncoded("url".into(), "https://news.example.com/a/2".into()),
            ]))
            .with_status(200)
            .with_body("https://is.gd/xyz")
            .create_async()
            .await;

        let cfg = ShortenerConfig {
            providers: vec![
                ShortenerProviderConfig {
                    kind: ShortenerKind::Tinyurl,
                    base_url: Some(server.url()),
                    timeout_seconds: Some(2),
                },
                ShortenerProviderConfig {
                    kind: ShortenerKind::Isgd,
                    base_url: Some(server.url()),
                    timeout_seconds: Some(2),
                },
            ],
        };
        let chain = build_chain(&cfg);
        assert_eq!(chain.len(), 2);
        let short = shorten_with(&chain, "https://news.example.com/a/2").await.unwrap();
        assert_eq!(short, "https://is.gd/xyz");
    }

    #[tokio::test]
    async fn error_bodies_are_not_links() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/create.php")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("Error: Please enter a valid URL to shorten")
            .create_async()
            .await;

        let shortener = IsGdShortener::new(Some(server.url().as_str()));
        assert!(shortener.shorten("not a url").await.is_err());
    }
}
