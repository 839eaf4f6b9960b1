// ABOUTME: Typed configuration tree for the executor with serde-backed defaults
// ABOUTME: JSON loading, environment overrides, and memory limit parsing

use crate::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

mod validate;

pub const ENV_CACHE_DIR: &str = "EXECUTOR_CACHE_DIR";
pub const ENV_MAX_CACHE_SIZE: &str = "EXECUTOR_MAX_CACHE_SIZE";
pub const ENV_PRICE_PER_TG: &str = "EXECUTOR_PRICE_PER_TG";
pub const ENV_AUTO_CLEANUP: &str = "EXECUTOR_AUTO_CLEANUP";

const MIB: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub manager: ManagerConfig,
    pub languages: BTreeMap<Language, LanguageConfig>,
    pub fees: FeesConfig,
    pub cache: CacheConfig,
    pub validation: ValidationConfig,
    pub monitoring: MonitoringConfig,
    pub http: HttpConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let languages = Language::ALL
            .iter()
            .map(|lang| (*lang, LanguageConfig::for_language(*lang)))
            .collect();

        Self {
            manager: ManagerConfig::default(),
            languages,
            fees: FeesConfig::default(),
            cache: CacheConfig::default(),
            validation: ValidationConfig::default(),
            monitoring: MonitoringConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Parse a JSON document; missing fields fall back to defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_json_str(&contents)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = env::var(ENV_CACHE_DIR) {
            if !dir.trim().is_empty() {
                self.cache.cache_dir = PathBuf::from(dir);
            }
        }

        if let Ok(value) = env::var(ENV_MAX_CACHE_SIZE) {
            self.cache.max_cache_size = value
                .trim()
                .parse()
                .map_err(|_| invalid_env(ENV_MAX_CACHE_SIZE, &value))?;
        }

        if let Ok(value) = env::var(ENV_PRICE_PER_TG) {
            self.fees.price_per_tg = value
                .trim()
                .parse()
                .map_err(|_| invalid_env(ENV_PRICE_PER_TG, &value))?;
        }

        if let Ok(value) = env::var(ENV_AUTO_CLEANUP) {
            self.manager.auto_cleanup = match value.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid_env(ENV_AUTO_CLEANUP, &value)),
            };
        }

        Ok(())
    }

    /// Check every section and report all problems at once
    pub fn validate(&self) -> Result<()> {
        let errors = validate::collect_errors(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    pub fn language(&self, language: Language) -> Option<&LanguageConfig> {
        self.languages.get(&language)
    }

    /// Languages that have configuration, in a stable order
    pub fn configured_languages(&self) -> Vec<Language> {
        self.languages.keys().copied().collect()
    }
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Force-remove containers once they leave a pool
    pub auto_cleanup: bool,
    pub shutdown_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            auto_cleanup: true,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ManagerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanguageConfig {
    pub docker: DockerConfig,
    pub pool: PoolConfig,
    pub run_command: String,
    pub extensions: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self::for_language(Language::Go)
    }
}

impl LanguageConfig {
    pub fn for_language(language: Language) -> Self {
        let (image, run_command) = match language {
            Language::Go => ("golang:1.21-alpine", "go run code.go"),
            Language::Py => ("python:3.12-alpine", "python code.py"),
            Language::Js | Language::Node => ("node:22-alpine", "node code.js"),
            Language::Ts => (
                "node:22-alpine",
                "tsc code.ts --outDir . --target es2020 --module commonjs && node code.js",
            ),
        };

        let extensions = match language {
            Language::Node => vec![".js".to_string(), ".mjs".to_string()],
            other => vec![other.extension().to_string()],
        };

        Self {
            docker: DockerConfig {
                image: image.to_string(),
                ..DockerConfig::default()
            },
            pool: PoolConfig::default(),
            run_command: run_command.to_string(),
            extensions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    /// Memory limit such as `512m` or `1g`
    pub memory_limit: String,
    pub cpu_limit: f64,
    /// Upper bound on a single execution
    pub timeout_secs: u64,
    pub network_mode: String,
    /// Extra `KEY=value` environment entries
    pub environment: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "golang:1.21-alpine".to_string(),
            memory_limit: "1024m".to_string(),
            cpu_limit: 1.0,
            timeout_secs: 300,
            network_mode: "bridge".to_string(),
            environment: Vec::new(),
        }
    }
}

impl DockerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn memory_bytes(&self) -> std::result::Result<i64, String> {
        parse_memory_limit(&self.memory_limit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub max_environments: usize,
    pub min_environments: usize,
    pub max_wait_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_environments: 5,
            min_environments: 2,
            max_wait_secs: 60,
            health_check_interval_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeesConfig {
    pub price_per_tg: f64,
    pub fixed_cost: f64,
    pub transaction_cost: f64,
    pub static_complexity_factor: f64,
    pub dynamic_complexity_factor: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            price_per_tg: 0.0001,
            fixed_cost: 1.0,
            transaction_cost: 1.0,
            static_complexity_factor: 0.1,
            dynamic_complexity_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_cache_size: u64,
    pub eviction_size: u64,
    pub max_file_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/cache"),
            max_cache_size: 100 * MIB,
            eviction_size: 25 * MIB,
            max_file_size: MIB,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    /// Substrings that make a source file invalid
    pub blocked_patterns: Vec<String>,
    /// Complexity above this produces a warning; 0 disables the check
    pub max_complexity: f64,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size: MIB,
            allowed_extensions: [".go", ".py", ".js", ".ts", ".mjs"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            blocked_patterns: [
                "os.RemoveAll",
                "exec.Command",
                "syscall",
                "runtime.GC",
                "panic(",
            ]
            .iter()
            .map(|pattern| pattern.to_string())
            .collect(),
            max_complexity: 10.0,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub health_check_interval_secs: u64,
    pub max_execution_time_secs: u64,
    pub min_success_rate: f64,
    pub max_average_execution_time_secs: u64,
    pub max_alerts: usize,
    pub alert_retention_secs: u64,
    pub critical_alert_penalty: f64,
    pub warning_alert_penalty: f64,
    pub critical_threshold: f64,
    pub warning_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            max_execution_time_secs: 300,
            min_success_rate: 0.9,
            max_average_execution_time_secs: 30,
            max_alerts: 100,
            alert_retention_secs: 3600,
            critical_alert_penalty: 20.0,
            warning_alert_penalty: 5.0,
            critical_threshold: 50.0,
            warning_threshold: 80.0,
        }
    }
}

impl MonitoringConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }

    pub fn max_average_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_average_execution_time_secs)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_secs(self.alert_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Parse a memory limit like `1024`, `512k`, `256m`, `1g`, or `1.5m` into bytes.
pub fn parse_memory_limit(limit: &str) -> std::result::Result<i64, String> {
    let trimmed = limit.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("memory limit is empty".to_string());
    }

    let (number, multiplier) = match trimmed.chars().last() {
        Some('b') => (&trimmed[..trimmed.len() - 1], 1.0),
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024.0),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024.0 * 1024.0 * 1024.0),
        _ => (trimmed.as_str(), 1.0),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid memory limit format: {}", limit))?;

    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid memory limit format: {}", limit));
    }

    Ok((value * multiplier) as i64)
}
