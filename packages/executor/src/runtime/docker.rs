// ABOUTME: Docker runtime implementation backed by the bollard client
// ABOUTME: Creates hardened, resource-limited containers and runs execs inside them

use super::{
    ContainerSpec, ContainerState, ContainerStatus, ExecOutput, ExecState, Result, Runtime,
    RuntimeError, MANAGED_LABEL,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        LogOutput, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions},
    models::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CPU_PERIOD: i64 = 100_000;
const EXEC_EXIT_POLL_ATTEMPTS: usize = 20;
const EXEC_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DockerRuntime {
    client: Docker,
    /// Images pulled by this runtime, keyed by reference
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the local daemon with a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes),
            cpu_quota: (spec.cpu_cores > 0.0)
                .then(|| (spec.cpu_cores * CPU_PERIOD as f64) as i64),
            cpu_period: Some(CPU_PERIOD),
            network_mode: (!spec.network_mode.is_empty()).then(|| spec.network_mode.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            cap_drop: Some(vec!["ALL".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env.clone()),
            working_dir: (!spec.working_dir.is_empty()).then(|| spec.working_dir.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            tty: Some(false),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::ImageError(e.to_string())),
        }
    }

    /// The output stream can close before the daemon records the exit code
    async fn wait_exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        for _ in 0..EXEC_EXIT_POLL_ATTEMPTS {
            let state = self.inspect_exec(exec_id).await?;
            if let Some(code) = finished_exit_code(&state) {
                return Ok(code);
            }
            tokio::time::sleep(EXEC_EXIT_POLL_INTERVAL).await;
        }

        Err(RuntimeError::ExecError(format!(
            "exit code of exec {} is unavailable",
            exec_id
        )))
    }
}

fn map_container_error(container_id: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container_id.to_string()),
        other => RuntimeError::ContainerError(other.to_string()),
    }
}

fn finished_exit_code(state: &ExecState) -> Option<i64> {
    if state.running {
        None
    } else {
        state.exit_code
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container {} from {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        for warning in &container.warnings {
            warn!("Container {} warning: {}", container.id, warning);
        }

        debug!("Created container: {}", container.id);
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        debug!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        self.client
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState> {
        let inspect = self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            RuntimeError::ContainerError("Container has no state information".to_string())
        })?;

        let status = ContainerStatus::from_state(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status,
        })
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| map_container_error(container_id, e))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        if self.image_cache.read().await.contains_key(image) && self.image_exists(image).await? {
            debug!("Image {} found in cache, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    RuntimeError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;

                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(error) = info.error {
                    return Err(RuntimeError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                self.image_cache
                    .write()
                    .await
                    .insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };

        let images = self
            .client
            .list_images(Some(options))
            .await
            .map_err(|e| RuntimeError::ImageError(e.to_string()))?;

        Ok(images
            .into_iter()
            .flat_map(|summary| summary.repo_tags)
            .collect())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        info!("Removing image: {}", image);

        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };

        self.client
            .remove_image(image, Some(options), None)
            .await
            .map_err(|e| RuntimeError::ImageError(e.to_string()))?;

        self.image_cache.write().await.remove(image);
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, command: Vec<String>) -> Result<String> {
        debug!("Creating exec in container {}: {:?}", container_id, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| map_container_error(container_id, e))?;

        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        let start_result = self
            .client
            .start_exec(exec_id, None)
            .await
            .map_err(|e| RuntimeError::ExecError(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(RuntimeError::ExecError(e.to_string())),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::ExecError(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exit_code = self.wait_exec_exit_code(exec_id).await?;

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| RuntimeError::ExecError(e.to_string()))?;

        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
            pid: inspect.pid,
            container_id: inspect.container_id.unwrap_or_default(),
        })
    }

    async fn copy_to_container(
        &self,
        container_id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        debug!(
            "Uploading {} byte archive to {}:{}",
            archive.len(),
            container_id,
            dest_dir
        );

        let options = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| RuntimeError::CopyError(e.to_string()))
    }

    async fn copy_from_container(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        let mut stream = self
            .client
            .download_from_container(container_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| RuntimeError::CopyError(e.to_string()))?;
            data.extend_from_slice(&bytes);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "sandbox-py-1234".to_string(),
            image: "python:3.12-alpine".to_string(),
            command: vec!["sh".into(), "-c".into(), "tail -f /dev/null".into()],
            working_dir: "/code".to_string(),
            env: vec!["PYTHONUNBUFFERED=1".to_string()],
            memory_bytes: 512 * 1024 * 1024,
            cpu_cores: 1.5,
            network_mode: "none".to_string(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_container_config_is_hardened() {
        let config = DockerRuntime::to_bollard_config(&spec());
        let host = config.host_config.unwrap();

        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.privileged, Some(false));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(150_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
    }

    #[test]
    fn test_container_config_carries_managed_label() {
        let config = DockerRuntime::to_bollard_config(&spec());
        let labels = config.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(config.working_dir.as_deref(), Some("/code"));
    }

    #[test]
    fn test_exit_code_requires_finished_exec() {
        let mut state = ExecState {
            running: true,
            exit_code: None,
            pid: Some(7),
            container_id: "c1".to_string(),
        };
        assert_eq!(finished_exit_code(&state), None);

        state.running = false;
        assert_eq!(finished_exit_code(&state), None, "unknown code is not a success");

        state.exit_code = Some(3);
        assert_eq!(finished_exit_code(&state), Some(3));

        state.running = true;
        assert_eq!(finished_exit_code(&state), None);
    }

    #[test]
    fn test_zero_limits_are_left_unset() {
        let mut spec = spec();
        spec.memory_bytes = 0;
        spec.cpu_cores = 0.0;
        spec.network_mode = String::new();

        let host = DockerRuntime::to_bollard_config(&spec).host_config.unwrap();
        assert_eq!(host.memory, None);
        assert_eq!(host.cpu_quota, None);
        assert_eq!(host.network_mode, None);
    }
}
