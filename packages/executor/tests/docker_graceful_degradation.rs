// ABOUTME: Tests for Docker runtime graceful degradation when the daemon is unavailable
// ABOUTME: Verifies the executor reports a clear error instead of panicking without Docker

mod common;

use code_executor::{CodeExecutor, DockerRuntime, ExecutorError, Language, Runtime};
use common::{test_config, StaticFetcher};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Connecting never panics; an error must say what went wrong
#[tokio::test]
async fn test_docker_runtime_unavailable_error() {
    match DockerRuntime::new() {
        Ok(runtime) => {
            // Availability is probed lazily, so either answer is fine here
            let available = runtime.is_available().await.unwrap();
            println!("Docker available: {}", available);
        }
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains("Connection") || message.contains("socket"),
                "error should explain the connection problem: {}",
                message
            );
        }
    }
}

/// Without a reachable daemon, initialization fails cleanly and the executor can still close
#[tokio::test]
async fn test_executor_initialization_without_docker() {
    let Ok(runtime) = DockerRuntime::new() else {
        return;
    };
    if runtime.is_available().await.unwrap_or(false) {
        println!("Note: Docker is available, skipping unavailable-daemon checks");
        return;
    }

    let dir = TempDir::new().unwrap();
    let executor = CodeExecutor::new(
        test_config(dir.path(), &[Language::Py], 1, 0),
        Arc::new(runtime),
        Arc::new(StaticFetcher::new()),
    )
    .await
    .expect("construction does not need the daemon");

    let err = executor
        .initialize(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::RuntimeUnavailable));

    executor.close().await.unwrap();
}
