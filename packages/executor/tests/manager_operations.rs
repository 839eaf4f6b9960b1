// ABOUTME: Integration tests for the environment manager over several language pools
// ABOUTME: Routing, execution timeouts, failure marking, image pulls, and shutdown

mod common;

use code_executor::{EnvironmentManager, Language, ManagerError, Runtime};
use common::{test_config, FakeRuntime, Program};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn manager(
    runtime: &Arc<FakeRuntime>,
    languages: &[Language],
    min: usize,
) -> (EnvironmentManager, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), languages, 2, min);
    let manager = EnvironmentManager::new(runtime.clone(), config);
    manager
        .initialize_language_pools(&CancellationToken::new(), languages)
        .await
        .expect("pools initialize");
    (manager, dir)
}

fn python_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".py").tempfile().unwrap();
    writeln!(file, "print('ok')").unwrap();
    file
}

#[tokio::test]
async fn test_pools_are_created_per_language() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[Language::Go, Language::Ts], 1).await;

    assert_eq!(
        manager.get_supported_languages().await,
        vec![Language::Go, Language::Ts]
    );
    let stats = manager.get_pool_stats().await;
    assert_eq!(stats[&Language::Go].ready, 1);
    assert_eq!(stats[&Language::Ts].ready, 1);
    assert!(manager.get_language_stats(Language::Py).await.is_none());

    let images = runtime.list_images().await.unwrap();
    assert!(images.contains(&"golang:1.21-alpine".to_string()));
    assert!(images.contains(&"node:22-alpine".to_string()));
}

#[tokio::test]
async fn test_unconfigured_language_is_skipped() {
    let runtime = Arc::new(FakeRuntime::new());
    let dir = TempDir::new().unwrap();
    let manager = EnvironmentManager::new(
        runtime.clone(),
        test_config(dir.path(), &[Language::Py], 1, 0),
    );

    manager
        .initialize_language_pools(&CancellationToken::new(), &[Language::Py, Language::Go])
        .await
        .unwrap();

    assert_eq!(manager.get_supported_languages().await, vec![Language::Py]);
    let err = manager
        .get_environment(&CancellationToken::new(), Language::Go)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NoPool(Language::Go)));
}

#[tokio::test]
async fn test_get_and_return_environment() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[Language::Py], 0).await;
    let token = CancellationToken::new();

    let env = manager.get_environment(&token, Language::Py).await.unwrap();
    assert_eq!(env.language, Language::Py);
    assert_eq!(manager.get_language_stats(Language::Py).await.unwrap().busy, 1);

    manager.return_environment(&env).await.unwrap();
    let stats = manager.get_language_stats(Language::Py).await.unwrap();
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn test_execution_uploads_source_and_reports_output() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_program(Program::Exit {
        code: 0,
        stdout: "ok".to_string(),
    });
    let (manager, _dir) = manager(&runtime, &[Language::Py], 0).await;
    let token = CancellationToken::new();
    let env = manager.get_environment(&token, Language::Py).await.unwrap();
    let file = python_file();

    let (result, exec_id) = manager
        .execute_in_environment(&token, &env.id, file.path(), Language::Py, |_| {})
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.output, "ok");
    assert!(exec_id.starts_with("exec-"));
    assert_eq!(runtime.uploads(&env.id), 1);
}

#[tokio::test]
async fn test_execution_timeout_kills_program() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_program(Program::Hang);
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &[Language::Py], 1, 0);
    if let Some(py) = config.languages.get_mut(&Language::Py) {
        py.docker.timeout_secs = 1;
    }
    let manager = EnvironmentManager::new(runtime.clone(), config);
    let token = CancellationToken::new();
    manager
        .initialize_language_pools(&token, &[Language::Py])
        .await
        .unwrap();

    let env = manager.get_environment(&token, Language::Py).await.unwrap();
    let file = python_file();
    let err = manager
        .execute_in_environment(&token, &env.id, file.path(), Language::Py, |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::Timeout(d) if d == Duration::from_secs(1)));
    assert_eq!(runtime.kills(), 1);
}

#[tokio::test]
async fn test_failed_environment_is_not_recycled() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[Language::Py], 0).await;
    let token = CancellationToken::new();

    let env = manager.get_environment(&token, Language::Py).await.unwrap();
    manager
        .mark_environment_failed(&env.id, Language::Py, "exit code 137")
        .await;
    manager.return_environment(&env).await.unwrap();

    assert_eq!(runtime.removed(), 1);
    let next = manager.get_environment(&token, Language::Py).await.unwrap();
    assert_ne!(next.id, env.id);
}

#[tokio::test]
async fn test_pull_image_is_idempotent() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[], 0).await;

    manager.pull_image("alpine:3.20").await.unwrap();
    manager.pull_image("alpine:3.20").await.unwrap();

    let images = runtime.list_images().await.unwrap();
    assert_eq!(images, vec!["alpine:3.20".to_string()]);
}

#[tokio::test]
async fn test_cleanup_environment_force_removes_container() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[Language::Py], 1).await;
    let env = manager
        .get_environment(&CancellationToken::new(), Language::Py)
        .await
        .unwrap();

    manager.cleanup_environment(&env.id).await.unwrap();
    assert_eq!(runtime.live_containers(), 0);
}

#[tokio::test]
async fn test_close_tears_down_every_pool() {
    let runtime = Arc::new(FakeRuntime::new());
    let (manager, _dir) = manager(&runtime, &[Language::Py, Language::Js], 1).await;
    assert_eq!(runtime.live_containers(), 2);

    manager.close().await;

    assert_eq!(runtime.live_containers(), 0);
    assert!(manager.get_supported_languages().await.is_empty());
    let err = manager
        .get_environment(&CancellationToken::new(), Language::Py)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NotInitialized));
}
