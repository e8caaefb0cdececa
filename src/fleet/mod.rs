//! Backend fleet supervision.
//!
//! One lifecycle state machine per configured backend: start/stop/restart,
//! a recurring health check, and supervised restarts for backends whose
//! process dies underneath a running proxy. The `ServerState` table is
//! owned exclusively by the supervisor; everything else sees snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{Credentials, ServerConfig, TransportType};
use crate::error::{Result, TychoError};
use crate::transport::{establish, Connection, GRACEFUL_SHUTDOWN};

/// Cadence of the recurring health scan and of supervised restart retries.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Pause between stopping and restarting a backend.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Lifecycle status of one backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
    Reconnecting,
}

struct ServerState {
    config: ServerConfig,
    status: ServerStatus,
    last_started: Option<DateTime<Utc>>,
    last_error: Option<String>,
    error_count: u32,
    restart_count: u32,
    handle: Option<Arc<Connection>>,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            status: ServerStatus::Stopped,
            last_started: None,
            last_error: None,
            error_count: 0,
            restart_count: 0,
            handle: None,
        }
    }

    fn snapshot(&self) -> ServerStatusSnapshot {
        ServerStatusSnapshot {
            name: self.config.name.clone(),
            status: self.status,
            transport: self.config.transport,
            enabled: self.config.enabled,
            last_started: self.last_started,
            last_error: self.last_error.clone(),
            error_count: self.error_count,
            restart_count: self.restart_count,
            connection_info: self
                .handle
                .as_ref()
                .map(|handle| handle.info().clone())
                .unwrap_or_default(),
        }
    }
}

/// Read-only view of one backend's state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusSnapshot {
    pub name: String,
    pub status: ServerStatus,
    pub transport: TransportType,
    pub enabled: bool,
    pub last_started: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub restart_count: u32,
    pub connection_info: HashMap<String, String>,
}

/// Aggregate outcome of `start_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub successful: usize,
    pub failed: usize,
}

struct FleetInner {
    credentials: Credentials,
    servers: RwLock<HashMap<String, ServerState>>,
    cancellation: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    restarts: Mutex<JoinSet<()>>,
    pending_restarts: Mutex<HashSet<String>>,
}

/// Supervises the lifecycle of every configured backend.
///
/// Cheap to clone; clones share the supervisor's state and tasks.
#[derive(Clone)]
pub struct FleetSupervisor {
    inner: Arc<FleetInner>,
}

impl FleetSupervisor {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(FleetInner {
                credentials,
                servers: RwLock::new(HashMap::new()),
                cancellation: CancellationToken::new(),
                monitor: Mutex::new(None),
                restarts: Mutex::new(JoinSet::new()),
                pending_restarts: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Credentials merged into stdio backend environments. Session-scoped
    /// connections use the same map the fleet does.
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Register every enabled backend and start the health monitor.
    pub async fn initialize(&self, servers: &[ServerConfig]) {
        tracing::info!("initializing fleet supervisor");
        {
            let mut table = self.inner.servers.write().await;
            for config in servers.iter().filter(|config| config.enabled) {
                tracing::info!(backend = %config.name, "registered backend");
                table.insert(config.name.clone(), ServerState::new(config.clone()));
            }
        }
        self.spawn_monitor().await;
        tracing::info!(
            backends = self.inner.servers.read().await.len(),
            "fleet supervisor initialized"
        );
    }

    /// Launch every registered backend concurrently. One backend's failure
    /// never blocks the others; every outcome lands in the report.
    pub async fn start_all(&self) -> StartReport {
        let names: Vec<String> = self.inner.servers.read().await.keys().cloned().collect();
        tracing::info!(backends = names.len(), "starting all backends");

        let mut tasks = JoinSet::new();
        for name in names {
            let supervisor = self.clone();
            tasks.spawn(async move { supervisor.start(&name).await });
        }

        let mut report = StartReport::default();
        while let Some(outcome) = tasks.join_next().await {
            match outcome {
                Ok(Ok(true)) => report.successful += 1,
                Ok(Ok(false)) | Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "start task failed to join");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(
            successful = report.successful,
            failed = report.failed,
            "backend startup complete"
        );
        report
    }

    /// Start one backend. Startup failures are recorded into the state
    /// table and reported as `Ok(false)`, never raised; `Err` only means
    /// the name is not registered.
    pub async fn start(&self, name: &str) -> Result<bool> {
        let config = {
            let mut servers = self.inner.servers.write().await;
            let state = servers.get_mut(name).ok_or_else(|| {
                TychoError::InvalidState(format!("backend '{name}' is not registered"))
            })?;
            match state.status {
                ServerStatus::Running => return Ok(true),
                ServerStatus::Starting => return Ok(false),
                _ => {}
            }
            state.status = ServerStatus::Starting;
            state.last_started = Some(Utc::now());
            state.config.clone()
        };

        tracing::info!(backend = %name, "starting backend");
        match establish(&config, &self.inner.credentials).await {
            Ok(connection) => {
                let stale = {
                    let mut servers = self.inner.servers.write().await;
                    match servers.get_mut(name) {
                        Some(state) if state.status == ServerStatus::Starting => {
                            state.handle = Some(Arc::new(connection));
                            state.status = ServerStatus::Running;
                            state.error_count = 0;
                            None
                        }
                        // Stopped while connecting; do not resurrect it.
                        _ => Some(connection),
                    }
                };
                match stale {
                    None => {
                        tracing::info!(backend = %name, "backend started");
                        Ok(true)
                    }
                    Some(connection) => {
                        let _ = connection.shutdown(GRACEFUL_SHUTDOWN).await;
                        Ok(false)
                    }
                }
            }
            Err(e) => {
                let mut servers = self.inner.servers.write().await;
                if let Some(state) = servers.get_mut(name) {
                    if state.status == ServerStatus::Starting {
                        state.status = ServerStatus::Error;
                    }
                    state.last_error = Some(e.to_string());
                    state.error_count += 1;
                }
                tracing::error!(backend = %name, error = %e, "failed to start backend");
                Ok(false)
            }
        }
    }

    /// Stop one backend: graceful termination with a bounded wait, forced
    /// kill past it. Unknown names are ignored.
    pub async fn stop(&self, name: &str) {
        let handle = {
            let mut servers = self.inner.servers.write().await;
            let Some(state) = servers.get_mut(name) else {
                return;
            };
            state.status = ServerStatus::Stopped;
            state.handle.take()
        };

        if let Some(handle) = handle {
            tracing::info!(backend = %name, "stopping backend");
            if let Err(e) = handle.shutdown(GRACEFUL_SHUTDOWN).await {
                tracing::error!(backend = %name, error = %e, "error stopping backend");
            }
        }
    }

    /// Stop every backend concurrently.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.inner.servers.read().await.keys().cloned().collect();
        tracing::info!(backends = names.len(), "stopping all backends");

        let mut tasks = JoinSet::new();
        for name in names {
            let supervisor = self.clone();
            tasks.spawn(async move { supervisor.stop(&name).await });
        }
        while tasks.join_next().await.is_some() {}
        tracing::info!("all backends stopped");
    }

    /// Stop, pause briefly, start again.
    pub async fn restart(&self, name: &str) -> Result<bool> {
        tracing::info!(backend = %name, "restarting backend");
        self.stop(name).await;
        tokio::time::sleep(RESTART_PAUSE).await;
        {
            let mut servers = self.inner.servers.write().await;
            if let Some(state) = servers.get_mut(name) {
                state.restart_count += 1;
            }
        }
        self.start(name).await
    }

    async fn spawn_monitor(&self) {
        let supervisor = self.clone();
        let task = tokio::spawn(async move {
            tracing::info!("health monitor started");
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = supervisor.inner.cancellation.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                supervisor.check_health_once().await;
            }
            tracing::info!("health monitor stopped");
        });
        *self.inner.monitor.lock().await = Some(task);
    }

    /// One health-scan pass: flip dead Running backends to Error and put
    /// them under supervised restart. The scan never blocks on a restart.
    pub async fn check_health_once(&self) {
        {
            let mut restarts = self.inner.restarts.lock().await;
            while restarts.try_join_next().is_some() {}
        }

        let mut dead: Vec<(String, Option<Arc<Connection>>)> = Vec::new();
        {
            let mut servers = self.inner.servers.write().await;
            for (name, state) in servers.iter_mut() {
                if state.status != ServerStatus::Running {
                    continue;
                }
                let terminated = match &state.handle {
                    Some(handle) => handle.is_terminated().await,
                    None => true,
                };
                if terminated {
                    tracing::warn!(backend = %name, "backend terminated unexpectedly");
                    state.status = ServerStatus::Error;
                    state.last_error = Some("process terminated unexpectedly".to_string());
                    state.error_count += 1;
                    dead.push((name.clone(), state.handle.take()));
                }
            }
        }

        for (name, handle) in dead {
            if let Some(handle) = handle {
                let _ = handle.shutdown(GRACEFUL_SHUTDOWN).await;
            }
            self.schedule_restart(name).await;
        }
    }

    /// Supervised restart: retries forever at the health-check cadence
    /// until the backend comes back or shutdown cancels it. At most one
    /// supervision task per backend.
    async fn schedule_restart(&self, name: String) {
        {
            let mut pending = self.inner.pending_restarts.lock().await;
            if !pending.insert(name.clone()) {
                return;
            }
        }

        let supervisor = self.clone();
        self.inner.restarts.lock().await.spawn(async move {
            loop {
                let restarted = tokio::select! {
                    _ = supervisor.inner.cancellation.cancelled() => break,
                    outcome = supervisor.restart(&name) => outcome.unwrap_or(false),
                };
                if restarted {
                    tracing::info!(backend = %name, "backend restarted");
                    break;
                }
                tracing::warn!(backend = %name, "supervised restart failed, retrying");
                tokio::select! {
                    _ = supervisor.inner.cancellation.cancelled() => break,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                }
            }
            supervisor
                .inner
                .pending_restarts
                .lock()
                .await
                .remove(&name);
        });
    }

    /// Cancel the monitor and supervised restarts, await them, then stop
    /// every backend.
    pub async fn shutdown(&self) {
        self.inner.cancellation.cancel();
        if let Some(monitor) = self.inner.monitor.lock().await.take() {
            if let Err(e) = monitor.await {
                tracing::error!(error = %e, "health monitor task failed");
            }
        }
        {
            let mut restarts = self.inner.restarts.lock().await;
            while restarts.join_next().await.is_some() {}
        }
        self.stop_all().await;
    }

    /// Names of backends currently Running.
    pub async fn running_backends(&self) -> Vec<String> {
        let servers = self.inner.servers.read().await;
        let mut names: Vec<String> = servers
            .iter()
            .filter(|(_, state)| state.status == ServerStatus::Running)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Configurations of backends currently Running.
    pub async fn running_configs(&self) -> Vec<ServerConfig> {
        let servers = self.inner.servers.read().await;
        let mut configs: Vec<ServerConfig> = servers
            .values()
            .filter(|state| state.status == ServerStatus::Running)
            .map(|state| state.config.clone())
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Status snapshot for one backend.
    pub async fn status(&self, name: &str) -> Option<ServerStatusSnapshot> {
        self.inner
            .servers
            .read()
            .await
            .get(name)
            .map(ServerState::snapshot)
    }

    /// Status snapshots for every backend, sorted by name.
    pub async fn status_all(&self) -> Vec<ServerStatusSnapshot> {
        let servers = self.inner.servers.read().await;
        let mut snapshots: Vec<ServerStatusSnapshot> =
            servers.values().map(ServerState::snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_server(name: &str) -> ServerConfig {
        ServerConfig::http(name, format!("http://localhost:9000/{name}"))
    }

    async fn supervisor_with(servers: &[ServerConfig]) -> FleetSupervisor {
        let supervisor = FleetSupervisor::new(Credentials::new());
        supervisor.initialize(servers).await;
        supervisor
    }

    #[tokio::test]
    async fn disabled_backends_are_not_registered() {
        let mut disabled = http_server("ghost");
        disabled.enabled = false;
        let supervisor = supervisor_with(&[http_server("search"), disabled]).await;

        assert!(supervisor.status("search").await.is_some());
        assert!(supervisor.status("ghost").await.is_none());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn start_of_unknown_backend_is_an_error() {
        let supervisor = supervisor_with(&[]).await;
        let err = supervisor
            .start("nowhere")
            .await
            .expect_err("unregistered backend cannot start");
        assert!(matches!(err, TychoError::InvalidState(_)));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_stop_clears_the_handle() {
        let supervisor = supervisor_with(&[http_server("search")]).await;

        assert!(supervisor.start("search").await.expect("registered"));
        let status = supervisor.status("search").await.expect("registered");
        assert_eq!(status.status, ServerStatus::Running);
        assert!(status.last_started.is_some());
        assert!(status.connection_info.contains_key("url"));

        supervisor.stop("search").await;
        let status = supervisor.status("search").await.expect("registered");
        assert_eq!(status.status, ServerStatus::Stopped);
        assert!(status.connection_info.is_empty());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn starting_a_running_backend_is_idempotent() {
        let supervisor = supervisor_with(&[http_server("search")]).await;
        assert!(supervisor.start("search").await.expect("registered"));
        assert!(supervisor.start("search").await.expect("registered"));

        let status = supervisor.status("search").await.expect("registered");
        assert_eq!(status.error_count, 0);
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_increments_the_counter() {
        let supervisor = supervisor_with(&[http_server("search")]).await;
        assert!(supervisor.start("search").await.expect("registered"));
        assert!(supervisor.restart("search").await.expect("registered"));

        let status = supervisor.status("search").await.expect("registered");
        assert_eq!(status.restart_count, 1);
        assert_eq!(status.status, ServerStatus::Running);
        supervisor.shutdown().await;
    }
}
