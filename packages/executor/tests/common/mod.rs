// ABOUTME: Shared fixtures for integration tests: an in-memory runtime and a canned HTTP fetcher
// ABOUTME: Lets pools, the manager, and the pipeline run end to end without Docker or a network

#![allow(dead_code)]

use async_trait::async_trait;
use code_executor::config::{ExecutorConfig, LanguageConfig};
use code_executor::file::{FetchError, HttpFetcher};
use code_executor::runtime::{
    ContainerSpec, ContainerState, ContainerStatus, ExecOutput, ExecState, Result, Runtime,
    RuntimeError,
};
use code_executor::scripts;
use code_executor::Language;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What the user program does when the execution script runs
#[derive(Debug, Clone)]
pub enum Program {
    Exit { code: i64, stdout: String },
    /// Never finishes on its own
    Hang,
}

#[derive(Debug, Default)]
struct Container {
    running: bool,
    files: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Exec {
    container_id: String,
    script: String,
    running: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: usize,
    containers: HashMap<String, Container>,
    execs: HashMap<String, Exec>,
    images: Vec<String>,
    created: usize,
    removed: usize,
    kills: usize,
}

pub struct FakeRuntime {
    state: Mutex<State>,
    program: Mutex<Program>,
    fail_resets: Mutex<bool>,
    /// The next container inspect stalls this long and then fails
    slow_inspect_failure: Mutex<Option<Duration>>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            program: Mutex::new(Program::Exit {
                code: 0,
                stdout: String::new(),
            }),
            fail_resets: Mutex::new(false),
            slow_inspect_failure: Mutex::new(None),
        }
    }

    pub fn set_program(&self, program: Program) {
        *self.program.lock().unwrap() = program;
    }

    pub fn fail_resets(&self, fail: bool) {
        *self.fail_resets.lock().unwrap() = fail;
    }

    /// Make the next `inspect_container` hang for `delay`, then report a daemon error
    pub fn fail_next_inspect_after(&self, delay: Duration) {
        *self.slow_inspect_failure.lock().unwrap() = Some(delay);
    }

    /// Simulate a container dying underneath its pool
    pub fn stop(&self, container_id: &str) {
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(container_id) {
            container.running = false;
        }
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn removed(&self) -> usize {
        self.state.lock().unwrap().removed
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn kills(&self) -> usize {
        self.state.lock().unwrap().kills
    }

    pub fn uploads(&self, container_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.files.len())
            .unwrap_or(0)
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

fn wrap_output(stdout: &str) -> String {
    format!(
        "{}\n{}\n{}\n",
        scripts::START_MARKER,
        stdout,
        scripts::END_MARKER
    )
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
        let id = self.next_id("fake");
        let mut state = self.state.lock().unwrap();
        state.containers.insert(id.clone(), Container::default());
        state.created += 1;
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, container_id: &str, _timeout_secs: u64) -> Result<()> {
        self.stop(container_id);
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerState> {
        let stall = self.slow_inspect_failure.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
            return Err(RuntimeError::ConnectionError(
                "daemon stopped responding".to_string(),
            ));
        }

        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        Ok(ContainerState {
            status: if container.running {
                ContainerStatus::Running
            } else {
                ContainerStatus::Stopped
            },
            running: container.running,
        })
    }

    async fn remove_container(&self, container_id: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(container_id).is_some() {
            state.removed += 1;
            Ok(())
        } else {
            Err(RuntimeError::NotFound(container_id.to_string()))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.state.lock().unwrap().images.push(image.to_string());
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().images.clone())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.state.lock().unwrap().images.retain(|i| i != image);
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, command: Vec<String>) -> Result<String> {
        let id = self.next_id("exec");
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_string()));
        }
        state.execs.insert(
            id.clone(),
            Exec {
                container_id: container_id.to_string(),
                script: command.join(" "),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        let script = {
            let mut state = self.state.lock().unwrap();
            let exec = state
                .execs
                .get_mut(exec_id)
                .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
            exec.running = true;
            exec.script.clone()
        };

        if script.contains("kill -TERM") {
            self.state.lock().unwrap().kills += 1;
        }

        let is_reset = Language::ALL
            .iter()
            .any(|language| script.contains(scripts::cleanup_script(*language)));
        if is_reset && *self.fail_resets.lock().unwrap() {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "reset failed".to_string(),
            });
        }

        let output = if script.contains(scripts::START_MARKER) {
            let program = self.program.lock().unwrap().clone();
            match program {
                Program::Exit { code, stdout } => ExecOutput {
                    exit_code: code,
                    stdout: wrap_output(&stdout),
                    stderr: String::new(),
                },
                Program::Hang => std::future::pending().await,
            }
        } else {
            ExecOutput::default()
        };

        if let Some(exec) = self.state.lock().unwrap().execs.get_mut(exec_id) {
            exec.running = false;
        }
        Ok(output)
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState> {
        let state = self.state.lock().unwrap();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
        Ok(ExecState {
            running: exec.running,
            exit_code: (!exec.running).then_some(0),
            pid: Some(4242),
            container_id: exec.container_id.clone(),
        })
    }

    async fn copy_to_container(
        &self,
        container_id: &str,
        _dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?;
        container.files.push(archive);
        Ok(())
    }

    async fn copy_from_container(&self, container_id: &str, _path: &str) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .get(container_id)
            .and_then(|c| c.files.last().cloned())
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))
    }
}

/// Serves fixed bodies by URL and counts requests
#[derive(Default)]
pub struct StaticFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: &str, body: &str) -> Self {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                url: url.to_string(),
            })
    }
}

/// Language settings with small pools and short waits
pub fn language_config(language: Language, max: usize, min: usize) -> LanguageConfig {
    let mut config = LanguageConfig::for_language(language);
    config.pool.max_environments = max;
    config.pool.min_environments = min;
    config.pool.max_wait_secs = 1;
    config.pool.health_check_interval_secs = 3600;
    config.docker.timeout_secs = 5;
    config
}

/// Configuration for `languages` only, caching under `cache_dir`
pub fn test_config(
    cache_dir: &Path,
    languages: &[Language],
    max: usize,
    min: usize,
) -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    config.cache.cache_dir = cache_dir.to_path_buf();
    config.manager.shutdown_timeout_secs = 5;
    config.languages = languages
        .iter()
        .map(|language| (*language, language_config(*language, max, min)))
        .collect();
    config
}
