use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tycho::config::{Credentials, ServerConfig};
use tycho::fleet::FleetSupervisor;
use tycho::lifecycle::LifecycleManager;
use tycho::session::SessionIsolationManager;

async fn fixture() -> (FleetSupervisor, Arc<LifecycleManager>, SessionIsolationManager) {
    let servers = vec![
        ServerConfig::http("search", "http://localhost:9000/search"),
        ServerConfig::http("weather", "http://localhost:9000/weather"),
    ];
    let fleet = FleetSupervisor::new(Credentials::new());
    fleet.initialize(&servers).await;
    fleet.start_all().await;

    let lifecycle = Arc::new(LifecycleManager::new());
    let sessions = SessionIsolationManager::new(fleet.clone(), Arc::clone(&lifecycle));
    (fleet, lifecycle, sessions)
}

#[tokio::test(start_paused = true)]
async fn sessions_get_private_backend_handles() {
    let (fleet, _lifecycle, sessions) = fixture().await;

    let first = sessions
        .backend_handle("client-1", "search")
        .await
        .expect("running backend gets a session handle");
    let second = sessions
        .backend_handle("client-2", "search")
        .await
        .expect("running backend gets a session handle");

    // Never shared across sessions; stable within one session.
    assert!(!Arc::ptr_eq(&first, &second));
    let again = sessions
        .backend_handle("client-1", "search")
        .await
        .expect("handle persists for the session");
    assert!(Arc::ptr_eq(&first, &again));

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn handles_exist_only_for_backends_running_at_creation() {
    let (fleet, _lifecycle, sessions) = fixture().await;
    fleet.stop("weather").await;

    sessions.get_or_create("client-1").await;
    assert!(sessions.backend_handle("client-1", "search").await.is_some());
    // Down at session creation; not upgraded mid-session.
    assert!(sessions.backend_handle("client-1", "weather").await.is_none());

    assert!(fleet.start("weather").await.expect("registered"));
    assert!(sessions.backend_handle("client-1", "weather").await.is_none());

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn activity_updates_bump_the_counters() {
    let (fleet, _lifecycle, sessions) = fixture().await;
    sessions.get_or_create("client-1").await;

    sessions
        .update_activity("client-1", Some(json!({ "type": "tools/call" })))
        .await;
    sessions
        .update_activity("client-1", Some(json!({ "type": "tools/list" })))
        .await;
    sessions.complete_request("client-1", None).await;

    let stats = sessions.stats().await;
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.sessions[0].request_count, 2);
    assert_eq!(stats.sessions[0].active_requests, 1);
    assert_eq!(stats.sessions[0].backends, vec!["search", "weather"]);
    assert_eq!(stats.total_backend_handles, 2);

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_regenerates_a_fresh_session() {
    let (fleet, lifecycle, sessions) = fixture().await;
    sessions.get_or_create("client-1").await;
    tokio::time::advance(Duration::from_secs(10)).await;
    sessions
        .update_activity("client-1", Some(json!({ "type": "tools/call" })))
        .await;

    sessions.cleanup("client-1").await;
    assert_eq!(sessions.active_count().await, 0);

    let fresh = sessions.get_or_create("client-1").await;
    assert_eq!(fresh.request_count, 0);
    assert_eq!(fresh.uptime(), Duration::ZERO);

    // No leakage across generations for the same client id.
    let metrics = lifecycle.metrics().snapshot().await;
    assert_eq!(metrics.global.total_sessions, 2);
    assert_eq!(metrics.global.active_sessions, 1);

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_of_an_unknown_client_is_a_noop() {
    let (fleet, lifecycle, sessions) = fixture().await;
    sessions.cleanup("nobody").await;
    assert_eq!(lifecycle.metrics().snapshot().await.global.total_sessions, 0);
    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_reclaims_only_stale_sessions() {
    let (fleet, lifecycle, sessions) = fixture().await;
    sessions.get_or_create("stale").await;
    sessions.get_or_create("active").await;

    tokio::time::advance(Duration::from_secs(7200)).await;
    sessions.update_activity("active", None).await;
    tokio::time::advance(Duration::from_secs(5)).await;

    let swept = sessions.idle_sweep(Duration::from_secs(3600)).await;
    assert_eq!(swept, 1);
    assert_eq!(sessions.active_count().await, 1);
    assert!(sessions.backend_handle("active", "search").await.is_some());

    let audit = lifecycle.audit().snapshot().await;
    assert!(audit
        .iter()
        .any(|record| record.event == "idle_timeout" && record.session_id == "stale"));

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_with_a_tiny_threshold_spares_recent_activity() {
    let (fleet, _lifecycle, sessions) = fixture().await;
    sessions.get_or_create("old").await;
    tokio::time::advance(Duration::from_secs(120)).await;
    sessions.get_or_create("new").await;

    let swept = sessions.idle_sweep(Duration::from_secs(1)).await;
    assert_eq!(swept, 1);
    assert_eq!(sessions.active_count().await, 1);

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn background_sweeper_runs_on_its_interval() {
    let (fleet, _lifecycle, sessions) = fixture().await;
    sessions.get_or_create("client-1").await;
    sessions
        .spawn_sweeper(Duration::from_secs(300), Duration::from_secs(60))
        .await;

    tokio::time::sleep(Duration::from_secs(301)).await;
    tokio::task::yield_now().await;

    assert_eq!(sessions.active_count().await, 0);

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_requests_converge_on_one_session() {
    let (fleet, lifecycle, sessions) = fixture().await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let sessions = sessions.clone();
        tasks.spawn(async move { sessions.get_or_create("client-1").await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task completes");
    }

    assert_eq!(sessions.active_count().await, 1);
    let metrics = lifecycle.metrics().snapshot().await;
    assert_eq!(metrics.global.total_sessions, 1);

    sessions.shutdown().await;
    fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_destroys_every_session() {
    let (fleet, lifecycle, sessions) = fixture().await;
    sessions.get_or_create("client-1").await;
    sessions.get_or_create("client-2").await;

    sessions.shutdown().await;
    assert_eq!(sessions.active_count().await, 0);

    let audit = lifecycle.audit().snapshot().await;
    let destroyed = audit.iter().filter(|record| record.event == "destroyed").count();
    assert_eq!(destroyed, 2);

    fleet.shutdown().await;
}
