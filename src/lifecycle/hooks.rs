//! Built-in lifecycle hooks: metrics, audit logging, pattern detection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

use super::{LifecycleHook, SessionEvent, SessionEventKind};

// ---------------------------------------------------------------------------
// MetricsAggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub request_count: u64,
    pub error_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// Running global counters. Averages are recomputed on every `Destroyed`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_session_duration_secs: f64,
    pub average_requests_per_session: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalMetrics,
    pub sessions: HashMap<String, SessionMetrics>,
}

#[derive(Default)]
struct MetricsState {
    sessions: HashMap<String, SessionMetrics>,
    global: GlobalMetrics,
    completed_sessions: u64,
    completed_duration_secs: f64,
}

/// Per-session and global counters. Per-session metrics are discarded when
/// the session is destroyed; only the global aggregates survive it.
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        MetricsSnapshot {
            global: state.global.clone(),
            sessions: state.sessions.clone(),
        }
    }
}

#[async_trait::async_trait]
impl LifecycleHook for MetricsAggregator {
    async fn on_created(&self, event: &SessionEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        state.sessions.insert(
            event.session_id.clone(),
            SessionMetrics {
                created_at: event.timestamp,
                started_at: None,
                request_count: 0,
                error_count: 0,
                last_activity: event.timestamp,
            },
        );
        state.global.total_sessions += 1;
        state.global.active_sessions += 1;
        Ok(())
    }

    async fn on_started(&self, event: &SessionEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&event.session_id) {
            session.started_at = Some(event.timestamp);
        }
        Ok(())
    }

    async fn on_request_received(&self, event: &SessionEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&event.session_id) {
            session.request_count += 1;
            session.last_activity = event.timestamp;
        }
        state.global.total_requests += 1;
        Ok(())
    }

    async fn on_error_occurred(&self, event: &SessionEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(&event.session_id) {
            session.error_count += 1;
        }
        state.global.total_errors += 1;
        Ok(())
    }

    async fn on_destroyed(&self, event: &SessionEvent) -> Result<()> {
        let SessionEventKind::Destroyed { duration_secs, .. } = &event.kind else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        state.sessions.remove(&event.session_id);
        state.completed_sessions += 1;
        state.completed_duration_secs += duration_secs;
        state.global.average_session_duration_secs =
            state.completed_duration_secs / state.completed_sessions as f64;
        if state.global.total_sessions > 0 {
            state.global.average_requests_per_session =
                state.global.total_requests as f64 / state.global.total_sessions as f64;
        }
        state.global.active_sessions = state.global.active_sessions.saturating_sub(1);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub session_id: String,
    pub event: &'static str,
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub detail: serde_json::Value,
}

/// Structured log line plus a retained record per lifecycle event.
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub async fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    async fn record(&self, event: &SessionEvent, level: AuditLevel) -> Result<()> {
        let detail = serde_json::to_value(&event.kind).unwrap_or(serde_json::Value::Null);
        match level {
            AuditLevel::Info => tracing::info!(
                session_id = %event.session_id,
                event = event.kind.name(),
                detail = %detail,
                "session event"
            ),
            AuditLevel::Warning => tracing::warn!(
                session_id = %event.session_id,
                event = event.kind.name(),
                detail = %detail,
                "session event"
            ),
            AuditLevel::Error => tracing::error!(
                session_id = %event.session_id,
                event = event.kind.name(),
                detail = %detail,
                "session event"
            ),
        }

        self.records.lock().await.push(AuditRecord {
            id: Uuid::new_v4(),
            session_id: event.session_id.clone(),
            event: event.kind.name(),
            timestamp: event.timestamp,
            level,
            detail,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl LifecycleHook for AuditLog {
    async fn on_created(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }

    async fn on_started(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }

    async fn on_request_received(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }

    async fn on_request_completed(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }

    async fn on_error_occurred(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Error).await
    }

    async fn on_idle_timeout(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Warning).await
    }

    async fn on_cleanup_started(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }

    async fn on_destroyed(&self, event: &SessionEvent) -> Result<()> {
        self.record(event, AuditLevel::Info).await
    }
}

// ---------------------------------------------------------------------------
// SecurityPatternDetector
// ---------------------------------------------------------------------------

/// Requests of one kind a single session may issue before the pattern is
/// flagged.
pub const SUSPICIOUS_REQUEST_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub session_id: String,
    /// `suspicious_activity` or `security_error`.
    pub category: &'static str,
    pub detail: String,
    pub count: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecuritySnapshot {
    pub pattern_counts: HashMap<String, u64>,
    pub alerts: Vec<SecurityAlert>,
}

#[derive(Default)]
struct SecurityState {
    pattern_counts: HashMap<String, u64>,
    alerts: Vec<SecurityAlert>,
}

/// Counts `(session, request-kind)` pairs and flags sessions that repeat
/// one request kind past the threshold. Counters are monotonic for the
/// session's lifetime.
pub struct SecurityPatternDetector {
    threshold: u64,
    state: Mutex<SecurityState>,
}

impl Default for SecurityPatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityPatternDetector {
    pub fn new() -> Self {
        Self::with_threshold(SUSPICIOUS_REQUEST_THRESHOLD)
    }

    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            state: Mutex::new(SecurityState::default()),
        }
    }

    pub async fn snapshot(&self) -> SecuritySnapshot {
        let state = self.state.lock().await;
        SecuritySnapshot {
            pattern_counts: state.pattern_counts.clone(),
            alerts: state.alerts.clone(),
        }
    }
}

#[async_trait::async_trait]
impl LifecycleHook for SecurityPatternDetector {
    async fn on_request_received(&self, event: &SessionEvent) -> Result<()> {
        let SessionEventKind::RequestReceived { request } = &event.kind else {
            return Ok(());
        };
        let request_kind = request
            .as_ref()
            .and_then(|r| r.get("type"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");

        let key = format!("{}:{request_kind}", event.session_id);
        let mut state = self.state.lock().await;
        let count = state.pattern_counts.entry(key).or_default();
        *count += 1;
        let count = *count;

        if count > self.threshold {
            tracing::warn!(
                session_id = %event.session_id,
                pattern = request_kind,
                count,
                "suspicious activity detected"
            );
            state.alerts.push(SecurityAlert {
                id: Uuid::new_v4(),
                session_id: event.session_id.clone(),
                category: "suspicious_activity",
                detail: request_kind.to_string(),
                count: Some(count),
                timestamp: event.timestamp,
            });
        }
        Ok(())
    }

    async fn on_error_occurred(&self, event: &SessionEvent) -> Result<()> {
        let SessionEventKind::ErrorOccurred { error } = &event.kind else {
            return Ok(());
        };
        let kind = error.kind.to_lowercase();
        if !["auth", "permission", "access"]
            .iter()
            .any(|marker| kind.contains(marker))
        {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state.alerts.push(SecurityAlert {
            id: Uuid::new_v4(),
            session_id: event.session_id.clone(),
            category: "security_error",
            detail: error.message.clone(),
            count: None,
            timestamp: event.timestamp,
        });
        Ok(())
    }
}
