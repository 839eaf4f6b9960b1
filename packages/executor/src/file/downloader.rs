// ABOUTME: HTTP retrieval of job source files into the cache
// ABOUTME: HttpFetcher trait with a reqwest implementation that retries transient failures

use super::cache::FileCache;
use super::validator::{CodeValidator, ValidationResult};
use super::{FileError, Result};
use crate::config::HttpConfig;
use crate::types::Language;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Client(_) => false,
        }
    }
}

/// Byte-level URL retrieval
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError>;
}

pub struct ReqwestFetcher {
    client: reqwest::Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl ReqwestFetcher {
    pub fn new(config: &HttpConfig) -> std::result::Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        })
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(url.to_string())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt;
                    warn!(
                        "Fetching {} failed ({}), retry {}/{} in {:?}",
                        url, e, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub content: Vec<u8>,
    pub hash: String,
    pub size: u64,
    pub is_cached: bool,
    pub validation: ValidationResult,
}

impl DownloadResult {
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert(
            "file_path".to_string(),
            self.file_path.display().to_string(),
        );
        metadata.insert("file_hash".to_string(), self.hash.clone());
        metadata.insert("file_size".to_string(), self.size.to_string());
        metadata.insert("is_cached".to_string(), self.is_cached.to_string());
        metadata.insert(
            "complexity".to_string(),
            format!("{:.2}", self.validation.complexity),
        );
        metadata.insert(
            "warnings".to_string(),
            self.validation.warnings.join("; "),
        );
        if !self.validation.is_valid {
            metadata.insert(
                "validation_errors".to_string(),
                self.validation.errors.join("; "),
            );
        }
        metadata
    }
}

pub struct Downloader {
    cache: Arc<FileCache>,
    fetcher: Arc<dyn HttpFetcher>,
    validator: CodeValidator,
    max_file_size: u64,
}

impl Downloader {
    pub fn new(
        cache: Arc<FileCache>,
        fetcher: Arc<dyn HttpFetcher>,
        validator: CodeValidator,
        max_file_size: u64,
    ) -> Self {
        Self {
            cache,
            fetcher,
            validator,
            max_file_size,
        }
    }

    /// Fetch `url` into the cache under `key` (unless already cached) and validate it
    pub async fn download_file(
        &self,
        key: &str,
        url: &str,
        language: Language,
    ) -> Result<DownloadResult> {
        let is_cached = self.cache.contains(key).await;
        let fetcher = self.fetcher.clone();
        let max_file_size = self.max_file_size;

        let file_path = self
            .cache
            .get_or_download(key, language, || async move {
                info!("Downloading {}", url);
                let content = fetcher.fetch(url).await?;
                let size = content.len() as u64;
                if size > max_file_size {
                    return Err(FileError::TooLarge {
                        size,
                        max: max_file_size,
                    });
                }
                Ok(content)
            })
            .await
            .map_err(|e| FileError::DownloadFailed(e.to_string()))?;

        let content = tokio::fs::read(&file_path).await.map_err(|source| {
            FileError::io(
                format!("failed to read cached file {}", file_path.display()),
                source,
            )
        })?;
        let validation = self.validator.validate_file(&file_path).await?;
        debug!(
            "Resolved {} to {} (cached: {})",
            url,
            file_path.display(),
            is_cached
        );

        Ok(DownloadResult {
            size: content.len() as u64,
            file_path,
            content,
            hash: key.to_string(),
            is_cached,
            validation,
        })
    }
}

#[cfg(test)]
pub(crate) use mock::MockHttpFetcher;
