use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::EmbeddingProvider;

/// Remote embedding provider using an OpenAI-compatible HTTP API
pub struct RemoteEmbeddingProvider {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl RemoteEmbeddingProvider {
    pub fn new(api_url: impl Into<String>, model: impl Into<String>) -> Self {
        let api_url = api_url.into();
        Self {
            endpoint: embedding_url(&api_url),
            api_key: None,
            model: model.into(),
            timeout: Duration::from_secs(10),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Infer the embeddings URL from whatever endpoint was configured.
/// e.g. http://localhost:11434/v1/chat/completions -> http://localhost:11434/v1/embeddings
fn embedding_url(base_url: &str) -> String {
    if base_url.ends_with("/embeddings") {
        base_url.to_string()
    } else if base_url.ends_with("/chat/completions") {
        base_url.replace("/chat/completions", "/embeddings")
    } else if base_url.ends_with("/completions") {
        base_url.replace("/completions", "/embeddings")
    } else {
        format!("{}/embeddings", base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req_body = EmbeddingRequest {
            model: self.model.clone(),
            input: text.to_string(),
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&req_body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .context("Embedding request timed out")?
            .context("Embedding HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error {}: {} (URL: {})", status, body, self.endpoint);
        }

        let body_text = tokio::time::timeout(self.timeout, response.text())
            .await
            .context("Embedding response timed out")?
            .context("Failed to read embedding response body")?;

        let vector = parse_embedding_body(&body_text)?;
        if vector.is_empty() {
            anyhow::bail!("Embedding response contained an empty vector");
        }
        Ok(vector)
    }
}

/// Accepts the OpenAI `{data: [{embedding}]}` shape, a bare float array, or
/// a single `{embedding: [...]}` object.
fn parse_embedding_body(body_text: &str) -> Result<Vec<f32>> {
    match serde_json::from_str::<EmbeddingResponse>(body_text) {
        Ok(resp_body) => {
            if let Some(first) = resp_body.data.into_iter().next() {
                return Ok(first.embedding);
            }
        }
        Err(e) => {
            if let Ok(raw_vec) = serde_json::from_str::<Vec<f32>>(body_text) {
                return Ok(raw_vec);
            }
            if let Ok(single) = serde_json::from_str::<SingleEmbedding>(body_text) {
                return Ok(single.embedding);
            }
            anyhow::bail!("Failed to parse Embedding response: {} (Body: {})", e, body_text);
        }
    }

    anyhow::bail!("Embedding response has no data: {}", body_text);
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct SingleEmbedding {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_url_inference() {
        assert_eq!(
            embedding_url("http://localhost:11434/v1/chat/completions"),
            "http://localhost:11434/v1/embeddings"
        );
        assert_eq!(embedding_url("http://host/v1/"), "http://host/v1/embeddings");
        assert_eq!(embedding_url("http://host/v1/embeddings"), "http://host/v1/embeddings");
    }

    #[test]
    fn parses_all_supported_body_shapes() {
        assert_eq!(
            parse_embedding_body(r#"{"data":[{"object":"embedding","embedding":[0.5,1.0],"index":0}],"model":"m"}"#).unwrap(),
            vec![0.5, 1.0]
        );
        assert_eq!(parse_embedding_body("[1.0, 2.0]").unwrap(), vec![1.0, 2.0]);
        assert_eq!(parse_embedding_body(r#"{"embedding":[3.0]}"#).unwrap(), vec![3.0]);
        assert!(parse_embedding_body(r#"{"data":[]}"#).is_err());
        assert!(parse_embedding_body("not json").is_err());
    }
}
