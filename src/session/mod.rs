//! Per-client session isolation.
//!
//! Every inbound client identity gets its own session record and its own
//! private set of backend connections, built with the same connectors the
//! fleet uses. Creation and destruction for one client id are serialized
//! by a per-session lock; different client ids never contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fleet::FleetSupervisor;
use crate::lifecycle::{ErrorInfo, LifecycleManager, SessionEventKind};
use crate::transport::{establish, Connection, GRACEFUL_SHUTDOWN};

/// Cadence of the recurring idle sweep.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Idle time after which a session is reclaimed.
pub const MAX_IDLE: Duration = Duration::from_secs(3600);

/// Per-client session bookkeeping.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub request_count: u64,
    pub active_requests: u32,
    created: Instant,
    last_activity: Instant,
}

impl ClientSession {
    fn new(client_id: &str) -> Self {
        let now = Instant::now();
        Self {
            client_id: client_id.to_string(),
            created_at: Utc::now(),
            request_count: 0,
            active_requests: 0,
            created: now,
            last_activity: now,
        }
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Time since the session was created.
    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }
}

#[derive(Default)]
struct SessionCell {
    session: Option<ClientSession>,
    handles: HashMap<String, Arc<Connection>>,
    /// Set once the slot has been cleaned up; a slot is never revived, the
    /// registry entry is re-created instead.
    retired: bool,
}

#[derive(Default)]
struct SessionSlot {
    cell: Mutex<SessionCell>,
}

/// Read-only view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub request_count: u64,
    pub active_requests: u32,
    pub backends: Vec<String>,
}

/// Statistics over every live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub total_backend_handles: usize,
    pub sessions: Vec<SessionDetail>,
}

struct SessionManagerInner {
    fleet: FleetSupervisor,
    lifecycle: Arc<LifecycleManager>,
    registry: Mutex<HashMap<String, Arc<SessionSlot>>>,
    cancellation: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Owns the session and handle tables.
///
/// Cheap to clone; clones share the manager's state and tasks.
#[derive(Clone)]
pub struct SessionIsolationManager {
    inner: Arc<SessionManagerInner>,
}

impl SessionIsolationManager {
    pub fn new(fleet: FleetSupervisor, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                fleet,
                lifecycle,
                registry: Mutex::new(HashMap::new()),
                cancellation: CancellationToken::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Resolve the slot for a client id, creating lock and record slot
    /// atomically under the registry guard.
    async fn slot(&self, client_id: &str) -> Arc<SessionSlot> {
        let mut registry = self.inner.registry.lock().await;
        Arc::clone(registry.entry(client_id.to_string()).or_default())
    }

    /// Get the session for a client, creating it on first contact.
    ///
    /// Concurrent first requests from one client id converge on a single
    /// session: the registry guard makes slot creation atomic and the
    /// per-slot lock serializes initialization.
    pub async fn get_or_create(&self, client_id: &str) -> ClientSession {
        loop {
            let slot = self.slot(client_id).await;
            let mut cell = slot.cell.lock().await;
            if cell.retired {
                // Lost a race with cleanup; resolve a fresh slot.
                continue;
            }
            if cell.session.is_none() {
                self.create_session(client_id, &mut cell).await;
            }
            if let Some(session) = &cell.session {
                return session.clone();
            }
        }
    }

    async fn create_session(&self, client_id: &str, cell: &mut SessionCell) {
        tracing::info!(client_id, "creating session");

        let client_info = HashMap::from([("client_id".to_string(), client_id.to_string())]);
        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::Created { client_info })
            .await;

        // One private connection per backend that is Running right now.
        // Handles are not upgraded mid-session; a backend that is down at
        // this point stays unavailable to this session.
        for config in self.inner.fleet.running_configs().await {
            match establish(&config, self.inner.fleet.credentials()).await {
                Ok(connection) => {
                    tracing::debug!(
                        client_id,
                        backend = %config.name,
                        "created session backend handle"
                    );
                    cell.handles
                        .insert(config.name.clone(), Arc::new(connection));
                }
                Err(e) => {
                    tracing::warn!(
                        client_id,
                        backend = %config.name,
                        error = %e,
                        "backend unavailable for session"
                    );
                }
            }
        }

        cell.session = Some(ClientSession::new(client_id));
        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::Started)
            .await;
    }

    /// The session-private handle for one backend, creating the session
    /// lazily when needed. `None` means the backend was not Running when
    /// this session was created.
    pub async fn backend_handle(&self, client_id: &str, backend: &str) -> Option<Arc<Connection>> {
        loop {
            let slot = self.slot(client_id).await;
            let mut cell = slot.cell.lock().await;
            if cell.retired {
                continue;
            }
            if cell.session.is_none() {
                self.create_session(client_id, &mut cell).await;
            }
            return cell.handles.get(backend).cloned();
        }
    }

    /// Record activity on an existing session.
    pub async fn update_activity(&self, client_id: &str, request: Option<serde_json::Value>) {
        let slot = {
            let registry = self.inner.registry.lock().await;
            registry.get(client_id).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        let mut cell = slot.cell.lock().await;
        let Some(session) = cell.session.as_mut() else {
            return;
        };
        session.last_activity = Instant::now();
        session.request_count += 1;
        session.active_requests += 1;
        drop(cell);

        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::RequestReceived { request })
            .await;
    }

    /// Record the successful completion of a request.
    pub async fn complete_request(&self, client_id: &str, metrics: Option<serde_json::Value>) {
        self.finish_request(client_id).await;
        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::RequestCompleted { metrics })
            .await;
    }

    /// Record a failed request.
    pub async fn fail_request(&self, client_id: &str, error: ErrorInfo) {
        self.finish_request(client_id).await;
        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::ErrorOccurred { error })
            .await;
    }

    async fn finish_request(&self, client_id: &str) {
        let slot = {
            let registry = self.inner.registry.lock().await;
            registry.get(client_id).cloned()
        };
        let Some(slot) = slot else {
            return;
        };
        let mut cell = slot.cell.lock().await;
        if let Some(session) = cell.session.as_mut() {
            session.active_requests = session.active_requests.saturating_sub(1);
        }
    }

    /// Destroy a session and every resource it holds.
    ///
    /// Handle-close failures are logged and reported as `ErrorOccurred`
    /// events but never prevent the remaining handles from closing.
    pub async fn cleanup(&self, client_id: &str) {
        let slot = {
            let registry = self.inner.registry.lock().await;
            registry.get(client_id).cloned()
        };
        let Some(slot) = slot else {
            return;
        };

        let mut cell = slot.cell.lock().await;
        if cell.retired {
            return;
        }
        tracing::info!(client_id, "cleaning up session");
        self.inner
            .lifecycle
            .emit(client_id, SessionEventKind::CleanupStarted)
            .await;

        let handles: Vec<(String, Arc<Connection>)> = cell.handles.drain().collect();
        for (backend, handle) in handles {
            if let Err(e) = handle.shutdown(GRACEFUL_SHUTDOWN).await {
                tracing::error!(
                    client_id,
                    backend = %backend,
                    error = %e,
                    "error closing backend handle"
                );
                self.inner
                    .lifecycle
                    .emit(
                        client_id,
                        SessionEventKind::ErrorOccurred {
                            error: ErrorInfo::for_backend("cleanup_error", backend, e.to_string()),
                        },
                    )
                    .await;
            }
        }

        let destroyed = cell.session.take().map(|session| SessionEventKind::Destroyed {
            duration_secs: session.uptime().as_secs_f64(),
            total_requests: session.request_count,
        });
        cell.retired = true;
        drop(cell);

        {
            let mut registry = self.inner.registry.lock().await;
            if let Some(current) = registry.get(client_id) {
                if Arc::ptr_eq(current, &slot) {
                    registry.remove(client_id);
                }
            }
        }

        if let Some(destroyed) = destroyed {
            self.inner.lifecycle.emit(client_id, destroyed).await;
        }
        tracing::debug!(client_id, "session cleanup complete");
    }

    /// Reclaim every session idle for longer than `max_idle`. Returns the
    /// number of sessions swept.
    pub async fn idle_sweep(&self, max_idle: Duration) -> usize {
        let slots: Vec<(String, Arc<SessionSlot>)> = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut idle = Vec::new();
        for (client_id, slot) in slots {
            let cell = slot.cell.lock().await;
            if let Some(session) = &cell.session {
                let idle_for = session.idle();
                if idle_for > max_idle {
                    idle.push((client_id, idle_for));
                }
            }
        }

        let swept = idle.len();
        for (client_id, idle_for) in idle {
            tracing::info!(
                client_id = %client_id,
                idle_secs = idle_for.as_secs(),
                "reclaiming idle session"
            );
            self.inner
                .lifecycle
                .emit(
                    &client_id,
                    SessionEventKind::IdleTimeout {
                        idle_secs: idle_for.as_secs(),
                    },
                )
                .await;
            self.cleanup(&client_id).await;
        }
        swept
    }

    /// Start the recurring idle sweep.
    pub async fn spawn_sweeper(&self, interval: Duration, max_idle: Duration) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            tracing::info!("idle sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.inner.cancellation.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                manager.idle_sweep(max_idle).await;
            }
            tracing::info!("idle sweeper stopped");
        });
        *self.inner.sweeper.lock().await = Some(task);
    }

    /// Cancel the sweeper, await it, then destroy every session.
    pub async fn shutdown(&self) {
        self.inner.cancellation.cancel();
        if let Some(sweeper) = self.inner.sweeper.lock().await.take() {
            if let Err(e) = sweeper.await {
                tracing::error!(error = %e, "idle sweeper task failed");
            }
        }

        let client_ids: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry.keys().cloned().collect()
        };
        for client_id in client_ids {
            self.cleanup(&client_id).await;
        }
    }

    /// Number of live sessions.
    pub async fn active_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Statistics over every live session, sorted by client id.
    pub async fn stats(&self) -> SessionStats {
        let slots: Vec<(String, Arc<SessionSlot>)> = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut sessions = Vec::new();
        let mut total_backend_handles = 0;
        for (client_id, slot) in slots {
            let cell = slot.cell.lock().await;
            let Some(session) = &cell.session else {
                continue;
            };
            let mut backends: Vec<String> = cell.handles.keys().cloned().collect();
            backends.sort();
            total_backend_handles += backends.len();
            sessions.push(SessionDetail {
                client_id,
                created_at: session.created_at,
                idle_secs: session.idle().as_secs(),
                request_count: session.request_count,
                active_requests: session.active_requests,
                backends,
            });
        }
        sessions.sort_by(|a, b| a.client_id.cmp(&b.client_id));

        SessionStats {
            active_sessions: sessions.len(),
            total_backend_handles,
            sessions,
        }
    }
}
