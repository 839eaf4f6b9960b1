// ABOUTME: Bounded per-language pool of pre-warmed execution environments
// ABOUTME: Acquire with health verification and wait queue, reset on release, periodic self-healing

use crate::config::LanguageConfig;
use crate::runtime::{self, ContainerSpec, Runtime, RuntimeError, MANAGED_LABEL};
use crate::scripts;
use crate::types::{EnvironmentStatus, Language, PoolStats, PooledEnvironment};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const START_POLL_ATTEMPTS: usize = 10;
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("timeout waiting for container in language pool {0}")]
    Timeout(Language),

    #[error("context cancelled")]
    Cancelled,

    #[error("failed to create environment for language {language}: {reason}")]
    CreationFailed { language: Language, reason: String },

    #[error("failed to reset environment {id}: {reason}")]
    ResetFailed { id: String, reason: String },

    #[error("language pool {0} is closed")]
    Closed(Language),

    #[error("failed to pull image for language {language}: {source}")]
    Image {
        language: Language,
        #[source]
        source: RuntimeError,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Default)]
struct PoolState {
    environments: HashMap<String, PooledEnvironment>,
    /// Creations in flight; they count against capacity
    pending: usize,
    created_count: u64,
    destroyed_count: u64,
    closed: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.environments.len() + self.pending
    }
}

pub struct EnvironmentPool {
    language: Language,
    config: LanguageConfig,
    runtime: Arc<dyn Runtime>,
    state: Mutex<PoolState>,
    available: Notify,
    shutdown: CancellationToken,
}

impl EnvironmentPool {
    pub fn new(language: Language, config: LanguageConfig, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            language,
            config,
            runtime,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn max_environments(&self) -> usize {
        self.config.pool.max_environments
    }

    /// Pull the base image, then pre-warm `min_environments` sequentially.
    /// Individual creation failures are logged and skipped.
    pub async fn initialize(&self, token: &CancellationToken) -> Result<()> {
        info!(
            "Initializing {} language pool (min: {}, max: {})",
            self.language, self.config.pool.min_environments, self.config.pool.max_environments
        );

        runtime::ensure_image(self.runtime.as_ref(), &self.config.docker.image)
            .await
            .map_err(|source| PoolError::Image {
                language: self.language,
                source,
            })?;

        let mut created = 0;
        for index in 0..self.config.pool.min_environments {
            if token.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            match self.add_ready_environment(token).await {
                Ok(true) => created += 1,
                Ok(false) => break,
                Err(PoolError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => warn!(
                    "Failed to create pre-warmed environment {} for language {}: {}",
                    index, self.language, e
                ),
            }
        }

        info!(
            "{} language pool initialized with {} environments",
            self.language, created
        );
        Ok(())
    }

    /// Check out an environment, creating one when capacity allows and waiting otherwise.
    ///
    /// Waiting ends at `max_wait` or when `token` is cancelled, whichever comes first.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<PooledEnvironment> {
        let deadline = Instant::now() + self.config.pool.max_wait();

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(env) = self.reserve_ready().await? {
                match self.runtime.inspect_container(&env.id).await {
                    Ok(state) if state.running => {
                        debug!("Environment {} verified as running, returning it", env.id);
                        return Ok(env);
                    }
                    Ok(state) => {
                        warn!(
                            "Environment {} is not running ({:?}), evicting",
                            env.id, state.status
                        );
                        self.evict(&env.id).await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Environment {} health check failed during acquire: {}", env.id, e);
                        self.evict(&env.id).await;
                        continue;
                    }
                }
            }

            if self.reserve_creation_slot().await {
                let created = self.create_environment(token).await;
                let mut state = self.state.lock().await;
                state.pending -= 1;

                return match created {
                    Ok(mut env) => {
                        env.status = EnvironmentStatus::Running;
                        env.last_used = Utc::now();
                        state.created_count += 1;
                        state.environments.insert(env.id.clone(), env.clone());
                        Ok(env)
                    }
                    Err(e) => {
                        drop(state);
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            debug!("{} pool at capacity, waiting for a release", self.language);
            tokio::select! {
                _ = &mut notified => continue,
                _ = token.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::Timeout(self.language));
                }
            }
        }
    }

    /// Reset an environment and make it available again.
    ///
    /// Environments marked failed, or whose reset fails, are destroyed instead.
    /// Releasing an untracked environment is a no-op.
    pub async fn release(&self, env_id: &str) -> Result<()> {
        let status = {
            let state = self.state.lock().await;
            match state.environments.get(env_id) {
                Some(env) => env.status,
                None => {
                    debug!(
                        "Environment {} not found in {} language pool",
                        env_id, self.language
                    );
                    return Ok(());
                }
            }
        };

        if status == EnvironmentStatus::Error {
            info!("Evicting failed environment {}", env_id);
            self.evict(env_id).await;
            self.available.notify_one();
            return Ok(());
        }

        if let Err(reason) = self.reset_environment(env_id).await {
            warn!("Failed to reset environment {}: {}", env_id, reason);
            self.evict(env_id).await;
            self.available.notify_one();
            return Err(PoolError::ResetFailed {
                id: env_id.to_string(),
                reason,
            });
        }

        {
            let mut state = self.state.lock().await;
            if let Some(env) = state.environments.get_mut(env_id) {
                env.status = EnvironmentStatus::Ready;
                env.last_used = Utc::now();
                env.last_error = None;
            }
        }

        self.available.notify_one();
        debug!("Returned environment {} to {} language pool", env_id, self.language);
        Ok(())
    }

    /// Flag an environment so its next release evicts it. Returns false when untracked.
    pub async fn mark_failed(&self, env_id: &str, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.environments.get_mut(env_id) {
            Some(env) => {
                env.status = EnvironmentStatus::Error;
                env.last_error = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, env_id: &str) -> bool {
        self.state.lock().await.environments.contains_key(env_id)
    }

    /// Inspect every tracked environment. Dead idle ones are destroyed, dead busy ones
    /// are flagged so their release destroys them. The pool is then topped up to its minimum.
    pub async fn health_check(&self) {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.environments.keys().cloned().collect()
        };

        let mut unhealthy = Vec::new();
        for id in ids {
            let (next_status, reason) = match self.runtime.inspect_container(&id).await {
                Ok(container) if container.running => continue,
                Ok(container) => (
                    EnvironmentStatus::Stopped,
                    format!("container not running: {:?}", container.status),
                ),
                Err(e) => (EnvironmentStatus::Error, e.to_string()),
            };

            warn!("Environment {} failed health check: {}", id, reason);
            // The environment may have been checked out while the inspect was in flight
            let mut state = self.state.lock().await;
            if let Some(env) = state.environments.get_mut(&id) {
                env.last_error = Some(reason);
                match env.status {
                    EnvironmentStatus::Ready => {
                        env.status = next_status;
                        unhealthy.push(id);
                    }
                    EnvironmentStatus::Running | EnvironmentStatus::Error => {
                        env.status = EnvironmentStatus::Error;
                    }
                    EnvironmentStatus::Stopped => {}
                }
            }
        }

        for id in unhealthy {
            self.evict(&id).await;
            self.available.notify_one();
        }

        self.ensure_min_environments(&self.shutdown).await;
    }

    /// Create environments until the pool holds at least `min_environments`
    pub async fn ensure_min_environments(&self, token: &CancellationToken) {
        while !token.is_cancelled() {
            match self.add_ready_environment(token).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(
                        "Failed to replenish {} language pool: {}",
                        self.language, e
                    );
                    break;
                }
            }
        }
    }

    /// Spawn the periodic health check; it runs until the pool is closed
    pub fn start_health_check(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = self.config.pool.health_check_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    _ = interval.tick() => pool.health_check().await,
                }
            }

            debug!("{} pool health check stopped", pool.language);
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let mut stats = PoolStats {
            language: Some(self.language),
            total: state.environments.len(),
            pending: state.pending,
            max_environments: self.config.pool.max_environments,
            created_count: state.created_count,
            destroyed_count: state.destroyed_count,
            ..Default::default()
        };

        for env in state.environments.values() {
            match env.status {
                EnvironmentStatus::Ready => stats.ready += 1,
                EnvironmentStatus::Running => stats.busy += 1,
                EnvironmentStatus::Error | EnvironmentStatus::Stopped => stats.error += 1,
            }
        }

        if stats.total > 0 {
            stats.utilization = stats.busy as f64 / stats.total as f64;
        }
        stats
    }

    /// Destroy every tracked environment regardless of status
    pub async fn close(&self) {
        self.shutdown.cancel();

        let ids: Vec<String> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            let ids = state.environments.keys().cloned().collect();
            state.destroyed_count += state.environments.len() as u64;
            state.environments.clear();
            ids
        };

        for id in &ids {
            self.destroy_container(id).await;
        }

        self.available.notify_waiters();
        info!(
            "Closed {} language pool ({} environments removed)",
            self.language,
            ids.len()
        );
    }

    async fn reserve_ready(&self) -> Result<Option<PooledEnvironment>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::Closed(self.language));
        }

        let env = state
            .environments
            .values_mut()
            .find(|env| env.status == EnvironmentStatus::Ready);

        Ok(env.map(|env| {
            env.status = EnvironmentStatus::Running;
            env.last_used = Utc::now();
            env.clone()
        }))
    }

    async fn reserve_creation_slot(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.occupied() < self.config.pool.max_environments {
            state.pending += 1;
            true
        } else {
            false
        }
    }

    /// Create one Ready environment if the pool is below its minimum
    async fn add_ready_environment(&self, token: &CancellationToken) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            if state.closed || state.occupied() >= self.config.pool.min_environments {
                return Ok(false);
            }
            state.pending += 1;
        }

        let created = self.create_environment(token).await;
        let mut state = self.state.lock().await;
        state.pending -= 1;
        let env = created?;

        state.created_count += 1;
        state.environments.insert(env.id.clone(), env);
        drop(state);

        self.available.notify_one();
        Ok(true)
    }

    async fn evict(&self, env_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let removed = state.environments.remove(env_id).is_some();
            if removed {
                state.destroyed_count += 1;
            }
            removed
        };

        if removed {
            self.destroy_container(env_id).await;
        }
    }

    async fn destroy_container(&self, container_id: &str) {
        if let Err(e) = self.runtime.remove_container(container_id, true).await {
            warn!("Failed to remove container {}: {}", container_id, e);
        }
    }

    async fn create_environment(&self, token: &CancellationToken) -> Result<PooledEnvironment> {
        let creation_failed = |reason: String| PoolError::CreationFailed {
            language: self.language,
            reason,
        };

        let memory_bytes = self.config.docker.memory_bytes().map_err(creation_failed)?;
        let spec = ContainerSpec {
            name: format!("sandbox-{}-{}", self.language, short_id()),
            image: self.config.docker.image.clone(),
            command: runtime::shell(scripts::KEEP_ALIVE_COMMAND),
            working_dir: scripts::WORK_DIR.to_string(),
            env: self.config.docker.environment.clone(),
            memory_bytes,
            cpu_cores: self.config.docker.cpu_limit,
            network_mode: self.config.docker.network_mode.clone(),
            labels: HashMap::from([(
                format!("{}.language", MANAGED_LABEL),
                self.language.to_string(),
            )]),
        };

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| creation_failed(e.to_string()))?;

        if let Err(e) = self.prepare_container(&container_id, token).await {
            self.destroy_container(&container_id).await;
            return Err(e);
        }

        info!(
            "Created environment for language {}: {}",
            self.language, container_id
        );
        Ok(PooledEnvironment::new(
            container_id,
            self.language,
            self.config.docker.image.clone(),
            scripts::WORK_DIR.to_string(),
        ))
    }

    async fn prepare_container(
        &self,
        container_id: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let creation_failed = |reason: String| PoolError::CreationFailed {
            language: self.language,
            reason,
        };

        self.runtime
            .start_container(container_id)
            .await
            .map_err(|e| creation_failed(format!("failed to start container: {}", e)))?;

        let mut running = false;
        for attempt in 1..=START_POLL_ATTEMPTS {
            let state = self
                .runtime
                .inspect_container(container_id)
                .await
                .map_err(|e| creation_failed(format!("failed to inspect container: {}", e)))?;

            if state.running {
                running = true;
                break;
            }

            debug!(
                "Container {} not running yet (attempt {}/{}), status: {:?}",
                container_id, attempt, START_POLL_ATTEMPTS, state.status
            );
            tokio::select! {
                _ = token.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(START_POLL_INTERVAL) => {}
            }
        }

        if !running {
            return Err(creation_failed(format!(
                "container {} failed to start properly",
                container_id
            )));
        }

        self.run_checked(container_id, scripts::initialization_script(self.language))
            .await
            .map_err(|e| creation_failed(format!("initialization failed: {}", e)))?;

        let verify = format!(
            "cd {} && {}",
            scripts::WORK_DIR,
            scripts::verification_command(self.language)
        );
        self.run_checked(container_id, &verify)
            .await
            .map_err(|e| creation_failed(format!("verification failed: {}", e)))?;

        Ok(())
    }

    async fn reset_environment(&self, env_id: &str) -> std::result::Result<(), String> {
        self.run_checked(env_id, scripts::cleanup_script(self.language))
            .await
    }

    async fn run_checked(
        &self,
        container_id: &str,
        script: &str,
    ) -> std::result::Result<(), String> {
        let command = runtime::shell(script);
        let output = runtime::run_command(self.runtime.as_ref(), container_id, command)
            .await
            .map_err(|e| e.to_string())?;

        if output.exit_code != 0 {
            error!(
                "Script in {} exited with {}: {}",
                container_id,
                output.exit_code,
                output.stderr.trim()
            );
            return Err(format!("exit code {}", output.exit_code));
        }
        Ok(())
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}
