// ABOUTME: Execution pipeline running one job through resolve, acquire, execute, process, release
// ABOUTME: Tracks active executions for cancellation and drains them on shutdown

use crate::dynamic_args::parse_dynamic_args;
use crate::fees::FeeCalculator;
use crate::file::{FileError, FileManager, ValidationResult};
use crate::manager::{EnvironmentManager, ManagerError};
use crate::types::{
    ActiveExecution, ExecutionResult, Language, PerformanceMetrics, PooledEnvironment,
    UnsupportedLanguage,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pseudo URL recorded for executions of inline source
pub const INLINE_SOURCE_URL: &str = "inline://source";

pub const TASK_DEFINITION_KEY: &str = "task_definition_id";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("execution pipeline is shutting down")]
    ShuttingDown,

    #[error("execution not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),

    #[error("invalid task_definition_id: {0}")]
    InvalidTaskDefinition(String),

    #[error("failed to download file: {0}")]
    Download(#[source] FileError),

    #[error("failed to write source file: {0}")]
    SourceFile(#[source] std::io::Error),

    #[error("failed to get environment: {0}")]
    Environment(#[source] ManagerError),

    #[error("failed to execute code: {0}")]
    Execution(#[source] ManagerError),

    #[error("timed out after {0:?} waiting for executions to finish")]
    ShutdownTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Job category derived from `task_definition_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Priced without running any code
    Static,
    /// Run, and the output turned into on-chain arguments
    Dynamic,
    Unspecified,
}

impl TaskKind {
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Result<Self> {
        let Some(raw) = metadata.get(TASK_DEFINITION_KEY) else {
            return Ok(TaskKind::Unspecified);
        };

        let id: u32 = raw
            .trim()
            .parse()
            .map_err(|_| PipelineError::InvalidTaskDefinition(raw.clone()))?;
        Ok(match id {
            1 | 3 | 5 | 7 => TaskKind::Static,
            2 | 4 | 6 => TaskKind::Dynamic,
            _ => TaskKind::Unspecified,
        })
    }
}

enum SourceFile {
    Url(String),
    Inline(PathBuf),
}

struct ExecutionContext {
    file_url: String,
    language: String,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    environment_id: Option<String>,
    exec_id: Arc<OnceLock<String>>,
}

impl ExecutionContext {
    fn snapshot(&self, trace_id: &str) -> ActiveExecution {
        ActiveExecution {
            trace_id: trace_id.to_string(),
            file_url: self.file_url.clone(),
            language: self.language.clone(),
            started_at: self.started_at,
            environment_id: self.environment_id.clone(),
            exec_id: self.exec_id.get().cloned(),
        }
    }
}

/// Decrements the in-flight counter when an execution unwinds
struct InFlightGuard<'a> {
    count: &'a AtomicUsize,
    drained: &'a Notify,
}

impl<'a> InFlightGuard<'a> {
    fn new(count: &'a AtomicUsize, drained: &'a Notify) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, drained }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Returns an environment to its pool exactly once.
///
/// Dropping an unreleased lease (the execution future was abandoned) hands the release to
/// a background task.
struct EnvironmentLease {
    manager: Arc<EnvironmentManager>,
    env: Option<PooledEnvironment>,
}

impl EnvironmentLease {
    fn new(manager: Arc<EnvironmentManager>, env: PooledEnvironment) -> Self {
        Self {
            manager,
            env: Some(env),
        }
    }

    async fn release(mut self) {
        if let Some(env) = self.env.take() {
            debug!("Returning environment {} to pool", env.id);
            if let Err(e) = self.manager.return_environment(&env).await {
                warn!("Failed to return environment {} to pool: {}", env.id, e);
            }
        }
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        let manager = Arc::clone(&self.manager);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.return_environment(&env).await {
                        warn!("Failed to return environment {} to pool: {}", env.id, e);
                    }
                });
            }
            Err(_) => warn!("Environment {} leaked: no runtime to release it", env.id),
        }
    }
}

struct ResolvedFile {
    path: PathBuf,
    validation: ValidationResult,
    metadata: HashMap<String, String>,
}

pub struct ExecutionPipeline {
    manager: Arc<EnvironmentManager>,
    files: Arc<FileManager>,
    fees: FeeCalculator,
    shutdown_timeout: Duration,
    active: RwLock<HashMap<String, ExecutionContext>>,
    metrics: RwLock<PerformanceMetrics>,
    in_flight: AtomicUsize,
    drained: Notify,
    shutdown: CancellationToken,
}

impl ExecutionPipeline {
    pub fn new(
        manager: Arc<EnvironmentManager>,
        files: Arc<FileManager>,
        fees: FeeCalculator,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            files,
            fees,
            shutdown_timeout,
            active: RwLock::new(HashMap::new()),
            metrics: RwLock::new(PerformanceMetrics::default()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run the job at `file_url`.
    ///
    /// Validation failures and non-zero exits come back as `Ok` with `success == false`;
    /// `Err` is reserved for failures of the pipeline itself.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        file_url: &str,
        language: &str,
        attester_count: usize,
        metadata: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.ensure_accepting()?;
        self.run(
            token,
            file_url,
            SourceFile::Url(file_url.to_string()),
            language,
            attester_count,
            metadata,
        )
        .await
    }

    /// Run inline source through the same stages, skipping the download
    pub async fn execute_source(
        &self,
        token: &CancellationToken,
        code: &str,
        language: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        self.ensure_accepting()?;
        let lang: Language = language.parse()?;

        let source = tempfile::Builder::new()
            .prefix("tx-src-")
            .suffix(lang.extension())
            .tempfile()
            .map_err(PipelineError::SourceFile)?;
        tokio::fs::write(source.path(), code)
            .await
            .map_err(PipelineError::SourceFile)?;

        // `source` stays alive until the run completes, then the file is deleted
        self.run(
            token,
            INLINE_SOURCE_URL,
            SourceFile::Inline(source.path().to_path_buf()),
            language,
            1,
            metadata,
        )
        .await
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(PipelineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    async fn run(
        &self,
        token: &CancellationToken,
        file_url: &str,
        source: SourceFile,
        language: &str,
        attester_count: usize,
        mut metadata: HashMap<String, String>,
    ) -> Result<ExecutionResult> {
        let started = Instant::now();
        let trace_id = format!("exec_{}", Uuid::new_v4().simple());
        info!("Starting execution {} for file: {}", trace_id, file_url);

        let _in_flight = InFlightGuard::new(&self.in_flight, &self.drained);
        let exec_token = token.child_token();
        let exec_id = Arc::new(OnceLock::new());

        self.active.write().await.insert(
            trace_id.clone(),
            ExecutionContext {
                file_url: file_url.to_string(),
                language: language.to_string(),
                started_at: Utc::now(),
                token: exec_token.clone(),
                environment_id: None,
                exec_id: Arc::clone(&exec_id),
            },
        );
        // close() may have swept the active map before this entry landed
        if self.shutdown.is_cancelled() {
            exec_token.cancel();
        }

        metadata.insert("no_of_attesters".to_string(), attester_count.to_string());
        let outcome = self
            .run_stages(&exec_token, &trace_id, source, language, metadata, &exec_id)
            .await;

        self.active.write().await.remove(&trace_id);

        let elapsed = started.elapsed();
        let mut metrics = self.metrics.write().await;
        match outcome {
            Ok(mut result) => {
                metrics.record(result.success, elapsed, result.stats.fee_ether);
                result.trace_id = trace_id;
                info!(
                    "Execution {} finished in {:?} (success: {})",
                    result.trace_id, elapsed, result.success
                );
                Ok(result)
            }
            Err(e) => {
                metrics.record(false, elapsed, 0.0);
                error!("Execution {} failed: {}", trace_id, e);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        token: &CancellationToken,
        trace_id: &str,
        source: SourceFile,
        language: &str,
        metadata: HashMap<String, String>,
        exec_slot: &Arc<OnceLock<String>>,
    ) -> Result<ExecutionResult> {
        let kind = TaskKind::from_metadata(&metadata)?;
        if kind == TaskKind::Static {
            info!("Static task {}, calculating fees only", trace_id);
            let result = ExecutionResult {
                success: true,
                ..Default::default()
            };
            return Ok(process_results(&self.fees, result, 0.0, kind, metadata));
        }

        let language: Language = language.parse()?;

        debug!("Stage 1: resolving source file for {}", trace_id);
        let resolved = self.resolve(source, language).await?;
        if !resolved.validation.is_valid {
            let mut result = ExecutionResult::failed(format!(
                "file validation failed: {}",
                resolved.validation.errors.join("; ")
            ));
            result.warnings = resolved.validation.warnings;
            result.metadata = metadata;
            result.metadata.extend(resolved.metadata);
            return Ok(result);
        }

        debug!("Stage 2: acquiring environment for {}", trace_id);
        let env_language = Language::from_file(&resolved.path);
        let env = self
            .manager
            .get_environment(token, env_language)
            .await
            .map_err(PipelineError::Environment)?;
        if let Some(ctx) = self.active.write().await.get_mut(trace_id) {
            ctx.environment_id = Some(env.id.clone());
        }
        let env_id = env.id.clone();
        let lease = EnvironmentLease::new(Arc::clone(&self.manager), env);

        debug!("Stage 3: executing {} in environment {}", trace_id, env_id);
        let slot = Arc::clone(exec_slot);
        let executed = self
            .manager
            .execute_in_environment(token, &env_id, &resolved.path, env_language, move |id| {
                let _ = slot.set(id.to_string());
            })
            .await;

        let outcome = match executed {
            Ok((result, _)) => {
                if !result.success {
                    let reason = result.error.as_deref().unwrap_or("non-zero exit");
                    self.manager
                        .mark_environment_failed(&env_id, env_language, reason)
                        .await;
                }
                debug!("Stage 4: processing results for {}", trace_id);
                let mut result = result;
                result.warnings = resolved.validation.warnings.clone();
                let mut metadata = metadata;
                metadata.extend(resolved.metadata);
                Ok(process_results(
                    &self.fees,
                    result,
                    resolved.validation.complexity,
                    kind,
                    metadata,
                ))
            }
            Err(ManagerError::Cancelled) => {
                info!("Execution {} cancelled", trace_id);
                Err(PipelineError::Execution(ManagerError::Cancelled))
            }
            Err(e) => {
                self.manager
                    .mark_environment_failed(&env_id, env_language, &e.to_string())
                    .await;
                Err(PipelineError::Execution(e))
            }
        };

        debug!("Stage 5: releasing environment {}", env_id);
        lease.release().await;
        outcome
    }

    async fn resolve(&self, source: SourceFile, language: Language) -> Result<ResolvedFile> {
        match source {
            SourceFile::Url(url) => {
                let download = self
                    .files
                    .download(&url, language)
                    .await
                    .map_err(PipelineError::Download)?;
                let metadata = download.metadata();
                Ok(ResolvedFile {
                    path: download.file_path,
                    validation: download.validation,
                    metadata,
                })
            }
            SourceFile::Inline(path) => {
                let validation = self
                    .files
                    .validate_file(&path)
                    .await
                    .map_err(PipelineError::Download)?;
                let mut metadata = HashMap::new();
                metadata.insert("file_path".to_string(), display(&path));
                Ok(ResolvedFile {
                    path,
                    validation,
                    metadata,
                })
            }
        }
    }

    /// Cancel an in-flight execution.
    ///
    /// Returns once cancellation has been requested; the running program is signalled in
    /// the background.
    pub async fn cancel_execution(&self, trace_id: &str) -> Result<()> {
        let (token, exec_id) = {
            let active = self.active.read().await;
            let ctx = active
                .get(trace_id)
                .ok_or_else(|| PipelineError::NotFound(trace_id.to_string()))?;
            (ctx.token.clone(), ctx.exec_id.get().cloned())
        };

        info!("Cancelling execution {}", trace_id);
        token.cancel();

        if let Some(exec_id) = exec_id {
            let manager = Arc::clone(&self.manager);
            tokio::spawn(async move {
                if let Err(e) = manager.kill_exec_process(&exec_id).await {
                    warn!("Failed to kill exec process {}: {}", exec_id, e);
                }
            });
        }
        Ok(())
    }

    pub async fn get_active_executions(&self) -> Vec<ActiveExecution> {
        let mut executions: Vec<ActiveExecution> = self
            .active
            .read()
            .await
            .iter()
            .map(|(trace_id, ctx)| ctx.snapshot(trace_id))
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        executions
    }

    pub async fn stats(&self) -> PerformanceMetrics {
        self.metrics.read().await.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refuse new work, cancel active executions, and wait for them to unwind
    pub async fn close(&self) -> Result<()> {
        info!("Closing execution pipeline");
        self.shutdown.cancel();

        for ctx in self.active.read().await.values() {
            ctx.token.cancel();
        }

        let drain = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("Execution pipeline closed");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "{} executions still running after {:?}",
                    self.in_flight(),
                    self.shutdown_timeout
                );
                Err(PipelineError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }
}

/// Attach timing, complexity, and fee data to a finished result
fn process_results(
    fees: &FeeCalculator,
    mut result: ExecutionResult,
    static_complexity: f64,
    kind: TaskKind,
    mut metadata: HashMap<String, String>,
) -> ExecutionResult {
    // static jobs never run, so only their static complexity is priced
    let (dynamic_complexity, fee) = match kind {
        TaskKind::Static => (0.0, fees.calculate_static(static_complexity)),
        TaskKind::Dynamic | TaskKind::Unspecified => {
            let dynamic_complexity = result.stats.execution_time.as_secs_f64();
            (
                dynamic_complexity,
                fees.calculate(static_complexity, dynamic_complexity),
            )
        }
    };

    result.stats.static_complexity = static_complexity;
    result.stats.dynamic_complexity = dynamic_complexity;
    result.stats.fee_tg = fee.fee_tg;
    result.stats.fee_ether = fee.fee_ether;
    result.stats.total_cost = fee.fee_wei;

    metadata.insert(
        "execution_time".to_string(),
        format!("{:?}", result.stats.execution_time),
    );
    metadata.insert(
        "static_complexity".to_string(),
        format!("{:.6}", static_complexity),
    );
    metadata.insert(
        "dynamic_complexity".to_string(),
        format!("{:.6}", dynamic_complexity),
    );
    metadata.insert("fee_tg".to_string(), format!("{:.6}", fee.fee_tg));
    metadata.insert("fee_ether".to_string(), format!("{:.18}", fee.fee_ether));
    metadata.insert("fees".to_string(), fee.fee_wei.to_string());

    if kind == TaskKind::Dynamic && result.success {
        let args = parse_dynamic_args(&result.output);
        metadata.insert(
            "on_chain_args".to_string(),
            serde_json::Value::Array(args).to_string(),
        );
    }

    result.metadata.extend(metadata);
    result
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
