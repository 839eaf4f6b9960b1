// ABOUTME: Sandboxed code execution engine running job scripts in pooled per-language containers
// ABOUTME: Downloads and caches source files, meters fees, and monitors execution health

pub mod config;
pub mod dynamic_args;
pub mod executor;
pub mod fees;
pub mod file;
pub mod logging;
pub mod manager;
pub mod monitor;
pub mod pipeline;
pub mod pool;
pub mod runtime;
pub mod scripts;
pub mod types;

pub use config::{ConfigError, ExecutorConfig};
pub use dynamic_args::parse_dynamic_args;
pub use executor::{CodeExecutor, ExecutorError};
pub use fees::{FeeBreakdown, FeeCalculator};
pub use file::{FileCache, FileManager, HttpFetcher, ReqwestFetcher};
pub use manager::{EnvironmentManager, ManagerError};
pub use monitor::{Alert, AlertSeverity, ExecutionMonitor, HealthState, HealthStatus};
pub use pipeline::{ExecutionPipeline, PipelineError, TaskKind};
pub use pool::{EnvironmentPool, PoolError};
pub use runtime::{DockerRuntime, Runtime, RuntimeError};
pub use types::{
    ActiveExecution, EnvironmentStatus, ExecutionResult, ExecutionStats, Language,
    PerformanceMetrics, PoolStats, PooledEnvironment,
};
