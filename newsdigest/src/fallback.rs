//! Ordered fallback over interchangeable providers: each provider is tried
//! in turn under its own timeout and the first success wins.

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct ChainLink<S: ?Sized> {
    label: String,
    service: Arc<S>,
    timeout: Duration,
}

pub struct FallbackChain<S: ?Sized> {
    links: Vec<ChainLink<S>>,
}

impl<S: ?Sized> Default for FallbackChain<S> {
    fn default() -> Self {
        Self { links: Vec::new() }
    }
}

impl<S: ?Sized + Send + Sync> FallbackChain<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, label: impl Into<String>, service: Arc<S>, timeout: Duration) -> Self {
        self.links.push(ChainLink {
            label: label.into(),
            service,
            timeout,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run `call` against each provider in order; return the first `Ok`.
    /// Errors and timeouts move on to the next provider.
    pub async fn first_success<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        for link in &self.links {
            match tokio::time::timeout(link.timeout, call(link.service.clone())).await {
                Ok(Ok(value)) => {
                    debug!(provider = %link.label, "fallback: provider succeeded");
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(provider = %link.label, error = %e, "fallback: provider failed");
                }
                Err(_) => {
                    warn!(provider = %link.label, timeout = ?link.timeout, "fallback: provider timed out");
                }
            }
        }
        anyhow::bail!("all {} providers failed", self.links.len())
    }
}
