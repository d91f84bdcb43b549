//! Source fetching seam

use crate::anonymity::client::{HttpError, ProxiedHttp};
use crate::config::{ProxyConfig, RegistryConfig};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("Fetch task failed: {0}")]
    Task(String),
}

/// Downloads one source document
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetcher that only ever talks through the anonymity proxy.
/// A new agent (and user agent string) is built for every request.
pub struct ProxiedFetcher {
    proxy: ProxyConfig,
    connect_timeout: Duration,
    timeout: Duration,
    max_bytes: u64,
}

impl ProxiedFetcher {
    pub fn new(proxy: &ProxyConfig, registry: &RegistryConfig) -> Self {
        Self {
            proxy: proxy.clone(),
            connect_timeout: Duration::from_secs(registry.connect_timeout_secs),
            timeout: Duration::from_secs(registry.fetch_timeout_secs),
            max_bytes: registry.max_download_bytes,
        }
    }
}

#[async_trait]
impl SourceFetcher for ProxiedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let client = ProxiedHttp::new(&self.proxy, self.connect_timeout, self.timeout, self.max_bytes)?;
        let url = url.to_string();
        tokio::task::spawn_blocking(move || client.get(&url))
            .await
            .map_err(|e| FetchError::Task(e.to_string()))?
            .map_err(FetchError::from)
    }
}
