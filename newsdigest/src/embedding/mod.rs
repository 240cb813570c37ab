use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub mod remote;

/// Core trait for sentence-embedding providers
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, recorded for diagnostics
    fn model(&self) -> &str;

    /// Generate a fixed-dimension vector embedding for text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Per-run memo so identical text always yields the identical vector,
/// and tracks consecutive failures to decide when the provider is down.
pub struct RunEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: HashMap<String, Arc<Vec<f32>>>,
    consecutive_failures: usize,
    max_consecutive_failures: usize,
}

impl RunEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, max_consecutive_failures: usize) -> Self {
        Self {
            provider,
            cache: HashMap::new(),
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
        }
    }

    /// False once the provider failed `max_consecutive_failures` times in a row.
    pub fn is_available(&self) -> bool {
        self.consecutive_failures < self.max_consecutive_failures
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub async fn embed(&mut self, text: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit.clone());
        }
        match self.provider.embed(text).await {
            Ok(vector) => {
                self.consecutive_failures = 0;
                let vector = Arc::new(vector);
                self.cache.insert(text.to_string(), vector.clone());
                Ok(vector)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                Err(e)
            }
        }
    }
}
