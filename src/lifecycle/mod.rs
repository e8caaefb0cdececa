//! Session lifecycle event bus.
//!
//! Typed events fan out concurrently to registered hooks; one hook's
//! failure is logged and never blocks delivery to the rest or the caller.

pub mod hooks;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::Result;

pub use hooks::{
    AuditLog, AuditRecord, MetricsAggregator, MetricsSnapshot, SecurityPatternDetector,
    SecuritySnapshot,
};

/// Error details carried by [`SessionEventKind::ErrorOccurred`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Short machine-readable error category (e.g. `cleanup_error`).
    pub kind: String,
    /// Backend involved, when the error is backend-specific.
    pub backend: Option<String>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            backend: None,
            message: message.into(),
        }
    }

    pub fn for_backend(
        kind: impl Into<String>,
        backend: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            backend: Some(backend.into()),
            message: message.into(),
        }
    }
}

/// Session lifecycle events and their payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    Created {
        client_info: HashMap<String, String>,
    },
    Started,
    RequestReceived {
        request: Option<serde_json::Value>,
    },
    RequestCompleted {
        metrics: Option<serde_json::Value>,
    },
    ErrorOccurred {
        error: ErrorInfo,
    },
    IdleTimeout {
        idle_secs: u64,
    },
    CleanupStarted,
    Destroyed {
        duration_secs: f64,
        total_requests: u64,
    },
}

impl SessionEventKind {
    /// Snake_case name of the event kind, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Started => "started",
            Self::RequestReceived { .. } => "request_received",
            Self::RequestCompleted { .. } => "request_completed",
            Self::ErrorOccurred { .. } => "error_occurred",
            Self::IdleTimeout { .. } => "idle_timeout",
            Self::CleanupStarted => "cleanup_started",
            Self::Destroyed { .. } => "destroyed",
        }
    }
}

/// Envelope for one emitted session event.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub id: Uuid,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, kind: SessionEventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// A lifecycle hook; implement only the callbacks you need.
#[async_trait::async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_created(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_started(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_request_received(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_request_completed(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_error_occurred(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_idle_timeout(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_cleanup_started(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }

    async fn on_destroyed(&self, event: &SessionEvent) -> Result<()> {
        let _ = event;
        Ok(())
    }
}

async fn deliver(hook: &Arc<dyn LifecycleHook>, event: &SessionEvent) -> Result<()> {
    match &event.kind {
        SessionEventKind::Created { .. } => hook.on_created(event).await,
        SessionEventKind::Started => hook.on_started(event).await,
        SessionEventKind::RequestReceived { .. } => hook.on_request_received(event).await,
        SessionEventKind::RequestCompleted { .. } => hook.on_request_completed(event).await,
        SessionEventKind::ErrorOccurred { .. } => hook.on_error_occurred(event).await,
        SessionEventKind::IdleTimeout { .. } => hook.on_idle_timeout(event).await,
        SessionEventKind::CleanupStarted => hook.on_cleanup_started(event).await,
        SessionEventKind::Destroyed { .. } => hook.on_destroyed(event).await,
    }
}

/// Point-in-time lifecycle statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStats {
    pub active_sessions: Vec<String>,
    pub active_session_count: usize,
    pub metrics: MetricsSnapshot,
    pub security: SecuritySnapshot,
}

/// Owns the hook list and fans events out to it.
pub struct LifecycleManager {
    hooks: RwLock<Vec<Arc<dyn LifecycleHook>>>,
    active_sessions: Mutex<HashSet<String>>,
    metrics: Arc<MetricsAggregator>,
    audit: Arc<AuditLog>,
    security: Arc<SecurityPatternDetector>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    /// Create a manager with the built-in hooks registered.
    pub fn new() -> Self {
        let metrics = Arc::new(MetricsAggregator::new());
        let audit = Arc::new(AuditLog::new());
        let security = Arc::new(SecurityPatternDetector::new());
        Self {
            hooks: RwLock::new(vec![
                Arc::clone(&metrics) as Arc<dyn LifecycleHook>,
                Arc::clone(&audit) as Arc<dyn LifecycleHook>,
                Arc::clone(&security) as Arc<dyn LifecycleHook>,
            ]),
            active_sessions: Mutex::new(HashSet::new()),
            metrics,
            audit,
            security,
        }
    }

    /// Register an additional hook.
    pub async fn add_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Build and emit an event for a session.
    pub async fn emit(&self, session_id: &str, kind: SessionEventKind) -> SessionEvent {
        let event = SessionEvent::new(session_id, kind);
        self.emit_event(&event).await;
        event
    }

    /// Fan an event out to every hook concurrently.
    ///
    /// Hook failures are logged and isolated; delivery to the remaining
    /// hooks and the caller's control flow are unaffected.
    pub async fn emit_event(&self, event: &SessionEvent) {
        {
            let mut active = self.active_sessions.lock().await;
            match &event.kind {
                SessionEventKind::Created { .. } => {
                    active.insert(event.session_id.clone());
                }
                SessionEventKind::Destroyed { .. } => {
                    active.remove(&event.session_id);
                }
                _ => {}
            }
        }

        let hooks = self.hooks.read().await.clone();
        let outcomes =
            futures::future::join_all(hooks.iter().map(|hook| deliver(hook, event))).await;
        for outcome in outcomes {
            if let Err(e) = outcome {
                tracing::error!(
                    session_id = %event.session_id,
                    event = event.kind.name(),
                    error = %e,
                    "lifecycle hook failed"
                );
            }
        }
    }

    /// The built-in metrics aggregator.
    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    /// The built-in audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The built-in suspicious-pattern detector.
    pub fn security(&self) -> &Arc<SecurityPatternDetector> {
        &self.security
    }

    /// Lifecycle statistics snapshot.
    pub async fn stats(&self) -> LifecycleStats {
        let active: Vec<String> = {
            let guard = self.active_sessions.lock().await;
            let mut ids: Vec<String> = guard.iter().cloned().collect();
            ids.sort();
            ids
        };
        LifecycleStats {
            active_session_count: active.len(),
            active_sessions: active,
            metrics: self.metrics.snapshot().await,
            security: self.security.snapshot().await,
        }
    }
}
