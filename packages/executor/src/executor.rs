// ABOUTME: CodeExecutor facade wiring configuration, runtime, pools, files, pipeline, and monitor
// ABOUTME: Public entry point used by job workers and operational tooling

use crate::config::{ConfigError, ExecutorConfig, FeesConfig};
use crate::fees::FeeCalculator;
use crate::file::{CacheStats, FetchError, FileError, FileManager, HttpFetcher, ReqwestFetcher};
use crate::manager::{EnvironmentManager, ManagerError};
use crate::monitor::{Alert, AlertSeverity, ExecutionMonitor, HealthStatus};
use crate::pipeline::{ExecutionPipeline, PipelineError};
use crate::runtime::{DockerRuntime, Runtime, RuntimeError};
use crate::types::{ActiveExecution, ExecutionResult, Language, PerformanceMetrics, PoolStats};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("code executor not initialized")]
    NotInitialized,

    #[error("code executor is closed")]
    Closed,

    #[error("container runtime is not available")]
    RuntimeUnavailable,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(Debug, Default)]
struct Lifecycle {
    initialized: bool,
    closed: bool,
}

pub struct CodeExecutor {
    config: ExecutorConfig,
    runtime: Arc<dyn Runtime>,
    manager: Arc<EnvironmentManager>,
    files: Arc<FileManager>,
    pipeline: Arc<ExecutionPipeline>,
    monitor: Arc<ExecutionMonitor>,
    lifecycle: RwLock<Lifecycle>,
}

impl CodeExecutor {
    /// Build every component from `config`. The configuration is validated first.
    pub async fn new(
        config: ExecutorConfig,
        runtime: Arc<dyn Runtime>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(EnvironmentManager::new(
            Arc::clone(&runtime),
            config.clone(),
        ));
        let files = Arc::new(
            FileManager::new(config.cache.clone(), config.validation.clone(), fetcher).await?,
        );
        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&manager),
            Arc::clone(&files),
            FeeCalculator::new(config.fees.clone()),
            config.manager.shutdown_timeout(),
        ));
        let monitor = Arc::new(ExecutionMonitor::new(
            Arc::clone(&pipeline),
            config.monitoring.clone(),
        ));

        Ok(Self {
            config,
            runtime,
            manager,
            files,
            pipeline,
            monitor,
            lifecycle: RwLock::new(Lifecycle::default()),
        })
    }

    /// Build an executor backed by the local Docker daemon and HTTP downloads
    pub async fn with_docker(config: ExecutorConfig) -> Result<Self> {
        let runtime = Arc::new(DockerRuntime::new()?);
        let fetcher = Arc::new(ReqwestFetcher::new(&config.http)?);
        Self::new(config, runtime, fetcher).await
    }

    /// Create pools for every configured language and start monitoring
    pub async fn initialize(&self, token: &CancellationToken) -> Result<()> {
        {
            let lifecycle = self.lifecycle.read().await;
            if lifecycle.closed {
                return Err(ExecutorError::Closed);
            }
            if lifecycle.initialized {
                return Ok(());
            }
        }

        info!("Initializing code executor");
        if !self.runtime.is_available().await? {
            return Err(ExecutorError::RuntimeUnavailable);
        }

        self.manager
            .initialize_language_pools(token, &self.config.configured_languages())
            .await?;
        self.monitor.start().await;

        self.lifecycle.write().await.initialized = true;
        info!(
            "Code executor initialized with languages: {:?}",
            self.manager.get_supported_languages().await
        );
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<()> {
        let lifecycle = self.lifecycle.read().await;
        if lifecycle.closed {
            Err(ExecutorError::Closed)
        } else if !lifecycle.initialized {
            Err(ExecutorError::NotInitialized)
        } else {
            Ok(())
        }
    }

    pub async fn execute(
        &self,
        token: &CancellationToken,
        file_url: &str,
        language: &str,
        attester_count: usize,
        metadata: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.ensure_ready().await?;
        info!(
            "Executing code from URL: {} with {} attesters",
            file_url, attester_count
        );
        Ok(self
            .pipeline
            .execute(token, file_url, language, attester_count, metadata)
            .await?)
    }

    pub async fn execute_source(
        &self,
        token: &CancellationToken,
        code: &str,
        language: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.ensure_ready().await?;
        Ok(self
            .pipeline
            .execute_source(token, code, language, metadata)
            .await?)
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        self.monitor.health_status().await
    }

    pub async fn get_stats(&self) -> PerformanceMetrics {
        self.pipeline.stats().await
    }

    pub async fn get_pool_stats(&self) -> HashMap<Language, PoolStats> {
        self.manager.get_pool_stats().await
    }

    pub async fn get_language_stats(&self, language: Language) -> Option<PoolStats> {
        self.manager.get_language_stats(language).await
    }

    pub async fn get_supported_languages(&self) -> Vec<Language> {
        self.manager.get_supported_languages().await
    }

    pub async fn is_language_supported(&self, language: Language) -> bool {
        self.manager.is_language_supported(language).await
    }

    pub async fn get_active_executions(&self) -> Vec<ActiveExecution> {
        self.pipeline.get_active_executions().await
    }

    pub async fn cancel_execution(&self, trace_id: &str) -> Result<()> {
        Ok(self.pipeline.cancel_execution(trace_id).await?)
    }

    pub async fn get_alerts(&self, severity: Option<AlertSeverity>, limit: usize) -> Vec<Alert> {
        self.monitor.get_alerts(severity, limit).await
    }

    pub async fn clear_alerts(&self) {
        self.monitor.clear_alerts().await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.files.cache_stats().await
    }

    pub fn fee_config(&self) -> &FeesConfig {
        &self.config.fees
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Stop monitoring, drain in-flight executions, and tear down every pool.
    ///
    /// Pools are closed even when draining times out; the drain error is returned afterwards.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if lifecycle.closed {
                return Ok(());
            }
            lifecycle.closed = true;
        }

        info!("Closing code executor");
        self.monitor.stop().await;
        let drained = self.pipeline.close().await;
        if let Err(e) = &drained {
            warn!("Execution pipeline did not drain cleanly: {}", e);
        }
        self.manager.close().await;

        info!("Code executor closed");
        Ok(drained?)
    }
}
