// ABOUTME: Source file resolution: download, on-disk caching, and structural validation
// ABOUTME: FileManager ties the cache, downloader, and validator behind one metadata-producing call

pub mod cache;
pub mod downloader;
pub mod validator;

pub use cache::{CacheStats, CachedFile, FileCache, METADATA_FILE};
pub use downloader::{DownloadResult, Downloader, FetchError, HttpFetcher, ReqwestFetcher};
pub use validator::{calculate_complexity, CodeValidator, ValidationResult};

use crate::config::{CacheConfig, ValidationConfig};
use crate::types::Language;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("failed to download or store file in cache: {0}")]
    DownloadFailed(String),

    #[error("file too large: {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl FileError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FileError>;

/// Entry point used by the pipeline to turn a URL into a validated local file
pub struct FileManager {
    cache: Arc<FileCache>,
    downloader: Downloader,
    validator: CodeValidator,
}

impl FileManager {
    pub async fn new(
        cache_config: CacheConfig,
        validation: ValidationConfig,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Result<Self> {
        let max_file_size = cache_config.max_file_size;
        let cache = Arc::new(FileCache::new(cache_config).await?);
        let validator = CodeValidator::new(validation);
        let downloader = Downloader::new(cache.clone(), fetcher, validator.clone(), max_file_size);

        info!("File manager ready (cache dir: {})", cache.cache_dir().display());
        Ok(Self {
            cache,
            downloader,
            validator,
        })
    }

    /// Resolve `url` to a cached file and validate it
    pub async fn download(&self, url: &str, language: Language) -> Result<DownloadResult> {
        self.downloader.download_file(url, url, language).await
    }

    /// Resolve `url` and describe the result as a flat metadata map
    pub async fn get_or_download(
        &self,
        url: &str,
        language: Language,
    ) -> Result<HashMap<String, String>> {
        let result = self.download(url, language).await?;
        Ok(result.metadata())
    }

    pub async fn validate_file(&self, path: &Path) -> Result<ValidationResult> {
        self.validator.validate_file(path).await
    }

    pub fn validate_content(&self, content: &[u8]) -> ValidationResult {
        self.validator.validate_content(content)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::downloader::MockHttpFetcher;
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir, fetcher: MockHttpFetcher) -> FileManager {
        let cache = CacheConfig {
            cache_dir: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        FileManager::new(cache, ValidationConfig::default(), Arc::new(fetcher))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_download_reports_metadata() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockHttpFetcher::new();
        fetcher
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(b"print('hi')\n".to_vec()));
        let manager = manager(&dir, fetcher).await;

        let url = "https://example.com/job.py";
        let first = manager.get_or_download(url, Language::Py).await.unwrap();
        assert_eq!(first["is_cached"], "false");
        assert_eq!(first["file_size"], "12");
        assert_eq!(first["file_hash"], url);
        assert!(!first.contains_key("validation_errors"));

        let second = manager.get_or_download(url, Language::Py).await.unwrap();
        assert_eq!(second["is_cached"], "true");
        assert_eq!(second["file_path"], first["file_path"]);
        assert_eq!(manager.cache_stats().await.hit_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_source_lists_errors() {
        let dir = TempDir::new().unwrap();
        let mut fetcher = MockHttpFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| Ok(b"package main\nimport \"syscall\"\n".to_vec()));
        let manager = manager(&dir, fetcher).await;

        let metadata = manager
            .get_or_download("https://example.com/main.go", Language::Go)
            .await
            .unwrap();
        assert_eq!(
            metadata["validation_errors"],
            "dangerous pattern found at line 2: syscall"
        );
    }
}
