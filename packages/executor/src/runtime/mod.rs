// ABOUTME: Runtime trait describing the isolation backend that hosts execution environments
// ABOUTME: Container, image, exec, and file-copy capabilities consumed by pools and the manager

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

/// Label attached to every container this crate creates
pub const MANAGED_LABEL: &str = "code-executor.managed";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Exec error: {0}")]
    ExecError(String),

    #[error("Copy error: {0}")]
    CopyError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to create one environment container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
    pub memory_bytes: i64,
    pub cpu_cores: f64,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Removing,
    Stopped,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn from_state(state: &str) -> Self {
        match state.to_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Stopped,
            "dead" => ContainerStatus::Dead,
            other => ContainerStatus::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub running: bool,
}

/// Captured output of a finished exec
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub pid: Option<i64>,
    pub container_id: String,
}

/// Isolation backend used by environment pools.
///
/// Implementations must be safe to share across pools; every method takes `&self`.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Check if the backend daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Create (but do not start) a container, returning its identifier
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState>;

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Locally available image references (`name:tag`)
    async fn list_images(&self) -> Result<Vec<String>>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Create an exec for `command` inside a running container, returning the exec identifier
    async fn create_exec(&self, container_id: &str, command: Vec<String>) -> Result<String>;

    /// Run a previously created exec to completion and collect its output
    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState>;

    /// Upload a tar archive and unpack it under `dest_dir`
    async fn copy_to_container(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()>;

    /// Download `path` from the container as a tar archive
    async fn copy_from_container(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;
}

/// Create and run an exec in one step
pub async fn run_command(
    runtime: &dyn Runtime,
    container_id: &str,
    command: Vec<String>,
) -> Result<ExecOutput> {
    let exec_id = runtime.create_exec(container_id, command).await?;
    runtime.start_exec(&exec_id).await
}

/// Pull `image` unless it (or its `:latest` tag) is already present locally
pub async fn ensure_image(runtime: &dyn Runtime, image: &str) -> Result<()> {
    match runtime.list_images().await {
        Ok(images) => {
            let latest = format!("{}:latest", image);
            if images.iter().any(|tag| tag == image || *tag == latest) {
                tracing::debug!("Image {} already exists locally, skipping pull", image);
                return Ok(());
            }
        }
        Err(e) => tracing::warn!("Failed to list images: {}", e),
    }

    runtime.pull_image(image).await
}

/// Shell invocation wrapper used for all scripts run inside environments
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// Build a single-entry tar archive holding `content` under `file_name`
pub fn single_file_archive(file_name: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();

    let mut archive = tar::Builder::new(Vec::new());
    archive.append_data(&mut header, file_name, content)?;
    archive.into_inner()
}

/// Read the first regular file out of a tar archive
pub fn first_file_in_archive(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive contains no files",
    ))
}
