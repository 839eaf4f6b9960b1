// ABOUTME: Shared domain types for pooled environments, executions, and statistics
// ABOUTME: Language detection, environment state machine, and result/metric snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Languages the engine can run. Each one is backed by its own environment pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Py,
    Js,
    Ts,
    Node,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Go,
        Language::Py,
        Language::Js,
        Language::Ts,
        Language::Node,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Py => "py",
            Language::Js => "js",
            Language::Ts => "ts",
            Language::Node => "node",
        }
    }

    /// Extension used for source files of this language, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Go => ".go",
            Language::Py => ".py",
            Language::Js | Language::Node => ".js",
            Language::Ts => ".ts",
        }
    }

    /// Name the source file gets inside the environment's working directory
    pub fn source_file_name(&self) -> String {
        format!("code{}", self.extension())
    }

    /// Maps a file extension (with or without the dot) to a language.
    /// Unknown extensions fall back to Go.
    pub fn from_extension(ext: &str) -> Language {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            "go" => Language::Go,
            "py" => Language::Py,
            "js" => Language::Js,
            "ts" => Language::Ts,
            "mjs" => Language::Node,
            _ => Language::Go,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Language {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Go)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnsupportedLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "go" | "golang" => Ok(Language::Go),
            "py" | "python" => Ok(Language::Py),
            "js" | "javascript" => Ok(Language::Js),
            "ts" | "typescript" => Ok(Language::Ts),
            "node" | "nodejs" => Ok(Language::Node),
            _ => Err(UnsupportedLanguage(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Ready,
    Running,
    Stopped,
    Error,
}

/// One isolated execution unit owned by a language pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledEnvironment {
    pub id: String,
    pub language: Language,
    pub status: EnvironmentStatus,
    pub image: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl PooledEnvironment {
    pub fn new(id: String, language: Language, image: String, working_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            language,
            status: EnvironmentStatus::Ready,
            image,
            working_dir,
            created_at: now,
            last_used: now,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub language: Option<Language>,
    pub total: usize,
    pub ready: usize,
    pub busy: usize,
    pub error: usize,
    pub pending: usize,
    pub max_environments: usize,
    pub utilization: f64,
    pub created_count: u64,
    pub destroyed_count: u64,
}

/// Resource and fee facts gathered for a single execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub execution_time: Duration,
    pub static_complexity: f64,
    pub dynamic_complexity: f64,
    pub fee_tg: f64,
    pub fee_ether: f64,
    /// Total fee in wei
    pub total_cost: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub trace_id: String,
    pub stats: ExecutionStats,
    pub output: String,
    pub stderr: String,
    pub success: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Aggregate pipeline statistics, recomputed incrementally after every execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub average_execution_time: Duration,
    pub min_execution_time: Duration,
    pub max_execution_time: Duration,
    /// Sum of execution fees in ether
    pub total_cost: f64,
    pub average_cost: f64,
    pub last_execution: Option<DateTime<Utc>>,
}

impl PerformanceMetrics {
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_executions == 0 {
            None
        } else {
            Some(self.successful_executions as f64 / self.total_executions as f64)
        }
    }

    pub fn record(&mut self, success: bool, duration: Duration, cost: f64) {
        self.total_executions += 1;
        self.last_execution = Some(Utc::now());

        if success {
            self.successful_executions += 1;
        } else {
            self.failed_executions += 1;
        }

        if self.total_executions == 1 || duration < self.min_execution_time {
            self.min_execution_time = duration;
        }
        if duration > self.max_execution_time {
            self.max_execution_time = duration;
        }

        let n = self.total_executions as f64;
        let avg = self.average_execution_time.as_secs_f64();
        let next = avg + (duration.as_secs_f64() - avg) / n;
        self.average_execution_time = Duration::from_secs_f64(next.max(0.0));

        self.total_cost += cost;
        self.average_cost = self.total_cost / n;
    }
}

/// Snapshot of an in-flight execution, safe to hand to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveExecution {
    pub trace_id: String,
    pub file_url: String,
    pub language: String,
    pub started_at: DateTime<Utc>,
    pub environment_id: Option<String>,
    pub exec_id: Option<String>,
}
