use std::time::Duration;

use tycho::config::{Credentials, ServerConfig};
use tycho::error::TychoError;
use tycho::fleet::{FleetSupervisor, ServerStatus, StartReport};

fn http_backend(name: &str) -> ServerConfig {
    ServerConfig::http(name, format!("http://localhost:9000/{name}"))
}

fn broken_backend(name: &str) -> ServerConfig {
    let mut config = ServerConfig::stdio(name, vec!["/nonexistent/tycho-test-binary".to_string()]);
    config.retry_attempts = 1;
    config
}

fn stdio_backend(name: &str, script: &str) -> ServerConfig {
    let mut config = ServerConfig::stdio(
        name,
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
    );
    config.retry_attempts = 1;
    config
}

async fn supervisor_with(servers: Vec<ServerConfig>) -> FleetSupervisor {
    let supervisor = FleetSupervisor::new(Credentials::new());
    supervisor.initialize(&servers).await;
    supervisor
}

#[tokio::test]
async fn start_all_isolates_the_failing_backend() {
    let supervisor = supervisor_with(vec![
        http_backend("search"),
        http_backend("weather"),
        broken_backend("broken"),
    ])
    .await;

    let report = supervisor.start_all().await;
    assert_eq!(
        report,
        StartReport {
            successful: 2,
            failed: 1
        }
    );

    for name in ["search", "weather"] {
        let status = supervisor.status(name).await.expect("registered backend");
        assert_eq!(status.status, ServerStatus::Running);
        assert!(status.last_error.is_none());
    }

    let broken = supervisor.status("broken").await.expect("registered backend");
    assert_eq!(broken.status, ServerStatus::Error);
    assert_eq!(broken.error_count, 1);
    let last_error = broken.last_error.expect("failed start records an error");
    assert!(!last_error.is_empty());

    supervisor.shutdown().await;
}

#[tokio::test]
async fn stop_all_returns_every_backend_to_stopped() {
    let supervisor = supervisor_with(vec![http_backend("search"), http_backend("weather")]).await;
    supervisor.start_all().await;

    supervisor.stop_all().await;
    for status in supervisor.status_all().await {
        assert_eq!(status.status, ServerStatus::Stopped);
        assert!(status.connection_info.is_empty());
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn unknown_backend_start_is_an_invalid_state_error() {
    let supervisor = supervisor_with(vec![http_backend("search")]).await;
    let err = supervisor
        .start("missing")
        .await
        .expect_err("unregistered name");
    assert!(matches!(err, TychoError::InvalidState(_)));
    supervisor.shutdown().await;
}

#[tokio::test]
async fn health_scan_leaves_live_backends_running() {
    let supervisor = supervisor_with(vec![stdio_backend("durable", "cat")]).await;
    assert!(supervisor.start("durable").await.expect("registered"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.check_health_once().await;

    let status = supervisor.status("durable").await.expect("registered");
    assert_eq!(status.status, ServerStatus::Running);
    assert_eq!(status.restart_count, 0);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn health_scan_restarts_a_dead_backend() {
    let supervisor = supervisor_with(vec![stdio_backend("flaky", "exit 0")]).await;
    assert!(supervisor.start("flaky").await.expect("registered"));

    // Let the process exit, then force one scan.
    tokio::time::sleep(Duration::from_millis(300)).await;
    supervisor.check_health_once().await;

    // The supervised restart stops, pauses one second, and starts again.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let status = supervisor.status("flaky").await.expect("registered");
    assert!(status.restart_count >= 1, "monitor should have restarted the backend");
    let last_error = status.last_error.expect("death is recorded");
    assert!(last_error.contains("terminated"));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_supervision_promptly() {
    let supervisor = supervisor_with(vec![stdio_backend("flaky", "exit 0")]).await;
    supervisor.start_all().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    supervisor.check_health_once().await;

    // A supervised restart may be mid-pause here; shutdown must still
    // cancel and await it instead of hanging or leaking the task.
    supervisor.shutdown().await;

    let status = supervisor.status("flaky").await.expect("registered");
    assert_ne!(status.status, ServerStatus::Running);
}

#[tokio::test]
async fn running_configs_reflect_only_running_backends() {
    let supervisor = supervisor_with(vec![
        http_backend("search"),
        http_backend("weather"),
        broken_backend("broken"),
    ])
    .await;
    supervisor.start_all().await;

    let names: Vec<String> = supervisor
        .running_configs()
        .await
        .into_iter()
        .map(|config| config.name)
        .collect();
    assert_eq!(names, vec!["search", "weather"]);
    assert_eq!(supervisor.running_backends().await, vec!["search", "weather"]);

    supervisor.shutdown().await;
}
