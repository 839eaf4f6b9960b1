// ABOUTME: Environment manager orchestrating per-language pools over a shared runtime
// ABOUTME: Routes acquire/release, runs source files inside environments, and handles forced cleanup

use crate::config::ExecutorConfig;
use crate::pool::{EnvironmentPool, PoolError};
use crate::runtime::{self, Runtime, RuntimeError};
use crate::scripts;
use crate::types::{ExecutionResult, Language, PoolStats, PooledEnvironment};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("environment manager not initialized")]
    NotInitialized,

    #[error("environment manager already initialized")]
    AlreadyInitialized,

    #[error("no pool available for language: {0}")]
    NoPool(Language),

    #[error("container {id} is not running (status: {status})")]
    NotRunning { id: String, status: String },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("execution timeout after {0:?}")]
    Timeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("failed to read source file {path}: {source}")]
    SourceFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, ManagerError>;

pub struct EnvironmentManager {
    runtime: Arc<dyn Runtime>,
    config: ExecutorConfig,
    pools: RwLock<HashMap<Language, Arc<EnvironmentPool>>>,
    initialized: RwLock<bool>,
}

impl EnvironmentManager {
    pub fn new(runtime: Arc<dyn Runtime>, config: ExecutorConfig) -> Self {
        Self {
            runtime,
            config,
            pools: RwLock::new(HashMap::new()),
            initialized: RwLock::new(false),
        }
    }

    pub fn runtime(&self) -> Arc<dyn Runtime> {
        Arc::clone(&self.runtime)
    }

    /// Create and warm one pool per configured language.
    ///
    /// Languages without configuration are skipped. A pool that fails to initialize is
    /// logged and left out; the manager still becomes initialized.
    pub async fn initialize_language_pools(
        &self,
        token: &CancellationToken,
        languages: &[Language],
    ) -> Result<()> {
        let mut initialized = self.initialized.write().await;
        if *initialized {
            return Err(ManagerError::AlreadyInitialized);
        }

        info!("Initializing language-specific environment pools");

        let mut candidates = Vec::new();
        for language in languages {
            match self.config.language(*language) {
                Some(lang_config) => candidates.push(Arc::new(EnvironmentPool::new(
                    *language,
                    lang_config.clone(),
                    Arc::clone(&self.runtime),
                ))),
                None => warn!("No configuration found for language {}, skipping", language),
            }
        }

        let results = join_all(candidates.iter().map(|pool| pool.initialize(token))).await;

        let mut pools = self.pools.write().await;
        for (pool, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    pool.start_health_check();
                    info!("Initialized pool for language: {}", pool.language());
                    pools.insert(pool.language(), pool);
                }
                Err(PoolError::Cancelled) => return Err(PoolError::Cancelled.into()),
                Err(e) => warn!(
                    "Failed to initialize pool for language {}: {}",
                    pool.language(),
                    e
                ),
            }
        }

        *initialized = true;
        info!("Language pools initialized with {} pools", pools.len());
        Ok(())
    }

    async fn pool(&self, language: Language) -> Result<Arc<EnvironmentPool>> {
        if !*self.initialized.read().await {
            return Err(ManagerError::NotInitialized);
        }

        self.pools
            .read()
            .await
            .get(&language)
            .cloned()
            .ok_or(ManagerError::NoPool(language))
    }

    pub async fn get_environment(
        &self,
        token: &CancellationToken,
        language: Language,
    ) -> Result<PooledEnvironment> {
        let pool = self.pool(language).await?;
        Ok(pool.acquire(token).await?)
    }

    pub async fn return_environment(&self, env: &PooledEnvironment) -> Result<()> {
        let pool = self.pool(env.language).await?;
        Ok(pool.release(&env.id).await?)
    }

    pub async fn get_pool_stats(&self) -> HashMap<Language, PoolStats> {
        let pools: Vec<Arc<EnvironmentPool>> = self.pools.read().await.values().cloned().collect();

        let mut stats = HashMap::new();
        for pool in pools {
            stats.insert(pool.language(), pool.stats().await);
        }
        stats
    }

    pub async fn get_language_stats(&self, language: Language) -> Option<PoolStats> {
        let pool = self.pools.read().await.get(&language).cloned()?;
        Some(pool.stats().await)
    }

    pub async fn get_supported_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.pools.read().await.keys().copied().collect();
        languages.sort();
        languages
    }

    pub async fn is_language_supported(&self, language: Language) -> bool {
        self.pools.read().await.contains_key(&language)
    }

    /// Flag an environment so it is destroyed instead of recycled on release
    pub async fn mark_environment_failed(&self, env_id: &str, language: Language, reason: &str) {
        match self.pool(language).await {
            Ok(pool) => {
                if pool.mark_failed(env_id, reason).await {
                    warn!("Marked environment {} as failed: {}", env_id, reason);
                } else {
                    warn!("Environment {} not tracked by {} pool", env_id, language);
                }
            }
            Err(e) => warn!("Cannot mark environment {} as failed: {}", env_id, e),
        }
    }

    /// Copy `file_path` into the environment and run it with the language's run command.
    ///
    /// `on_exec_created` receives the exec identifier before the program starts, so callers
    /// can kill it while it is still running. A non-zero exit status is reported through the
    /// result's `success` flag rather than as an error.
    pub async fn execute_in_environment<F>(
        &self,
        token: &CancellationToken,
        env_id: &str,
        file_path: &Path,
        language: Language,
        on_exec_created: F,
    ) -> Result<(ExecutionResult, String)>
    where
        F: FnOnce(&str) + Send,
    {
        info!(
            "Executing file {} in environment {} with language {}",
            file_path.display(),
            env_id,
            language
        );

        let lang_config = self
            .config
            .language(language)
            .ok_or(ManagerError::NoPool(language))?;

        let state = self.runtime.inspect_container(env_id).await?;
        if !state.running {
            return Err(ManagerError::NotRunning {
                id: env_id.to_string(),
                status: format!("{:?}", state.status),
            });
        }

        let content = tokio::fs::read(file_path)
            .await
            .map_err(|source| ManagerError::SourceFile {
                path: file_path.display().to_string(),
                source,
            })?;
        let archive = runtime::single_file_archive(&language.source_file_name(), &content)
            .map_err(RuntimeError::from)?;

        cancellable(token, async {
            self.runtime
                .copy_to_container(env_id, scripts::WORK_DIR, archive)
                .await
                .map_err(ManagerError::from)
        })
        .await?;

        let setup = cancellable(token, async {
            runtime::run_command(
                self.runtime.as_ref(),
                env_id,
                runtime::shell(scripts::setup_script(language)),
            )
            .await
            .map_err(ManagerError::from)
        })
        .await?;
        if setup.exit_code != 0 {
            return Err(ManagerError::ExecutionFailed(format!(
                "setup script failed with exit code: {}: {}",
                setup.exit_code,
                setup.stderr.trim()
            )));
        }

        let command = runtime::shell(scripts::execution_script(&lang_config.run_command));
        let exec_id = self.runtime.create_exec(env_id, command).await?;
        on_exec_created(&exec_id);

        let timeout = lang_config.docker.timeout();
        let started = Instant::now();
        let output = tokio::select! {
            output = self.runtime.start_exec(&exec_id) => output?,
            _ = token.cancelled() => {
                self.kill_quietly(&exec_id).await;
                return Err(ManagerError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                self.kill_quietly(&exec_id).await;
                return Err(ManagerError::Timeout(timeout));
            }
        };
        let elapsed = started.elapsed();

        debug!(
            "Exec {} finished with exit code {} in {:?}",
            exec_id, output.exit_code, elapsed
        );

        let success = output.exit_code == 0;
        let mut result = ExecutionResult {
            output: scripts::extract_output(&output.stdout),
            stderr: output.stderr,
            success,
            error: (!success)
                .then(|| format!("execution failed with exit code: {}", output.exit_code)),
            ..Default::default()
        };
        result.stats.execution_time = elapsed;

        Ok((result, exec_id))
    }

    /// Best-effort termination of an in-flight exec
    pub async fn kill_exec_process(&self, exec_id: &str) -> Result<()> {
        info!("Attempting to terminate exec process {}", exec_id);

        let state = self.runtime.inspect_exec(exec_id).await?;
        if !state.running {
            info!("Exec process {} is already terminated", exec_id);
            return Ok(());
        }

        let Some(pid) = state.pid.filter(|pid| *pid > 0) else {
            warn!("Exec process {} has no pid to signal", exec_id);
            return Ok(());
        };

        let kill = runtime::shell(format!("kill -TERM {}", pid));
        match runtime::run_command(self.runtime.as_ref(), &state.container_id, kill).await {
            Ok(output) if output.exit_code == 0 => {
                info!("Sent SIGTERM to exec process {} (pid {})", exec_id, pid)
            }
            Ok(output) => warn!(
                "kill for exec {} exited with {}: {}",
                exec_id,
                output.exit_code,
                output.stderr.trim()
            ),
            Err(e) => warn!("Failed to signal exec process {}: {}", exec_id, e),
        }
        Ok(())
    }

    async fn kill_quietly(&self, exec_id: &str) {
        if let Err(e) = self.kill_exec_process(exec_id).await {
            warn!("Failed to kill exec process {}: {}", exec_id, e);
        }
    }

    /// Pull an image unless it is already available locally
    pub async fn pull_image(&self, image: &str) -> Result<()> {
        Ok(runtime::ensure_image(self.runtime.as_ref(), image).await?)
    }

    /// Force-remove a container. Does nothing when auto cleanup is disabled.
    pub async fn cleanup_environment(&self, container_id: &str) -> Result<()> {
        if !self.config.manager.auto_cleanup {
            info!("Auto cleanup is disabled, skipping cleanup of {}", container_id);
            return Ok(());
        }

        Ok(self.runtime.remove_container(container_id, true).await?)
    }

    /// Close every pool and forget them
    pub async fn close(&self) {
        let pools: Vec<Arc<EnvironmentPool>> = {
            let mut pools = self.pools.write().await;
            pools.drain().map(|(_, pool)| pool).collect()
        };

        for pool in pools {
            pool.close().await;
        }

        *self.initialized.write().await = false;
        info!("Environment manager closed");
    }
}

async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        result = fut => result,
        _ = token.cancelled() => Err(ManagerError::Cancelled),
    }
}
