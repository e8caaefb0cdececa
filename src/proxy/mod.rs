//! Proxy request orchestration.
//!
//! Ties the fleet, the session layer, the namespace resolver, and the
//! lifecycle bus together behind one `handle_request` surface. The wire
//! protocol itself stays behind the [`RequestDispatcher`] seam — an
//! external client library implements it.

pub mod transform;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::{Credentials, ProxyConfig};
use crate::error::{Result, TychoError};
use crate::fleet::{FleetSupervisor, StartReport};
use crate::lifecycle::{ErrorInfo, LifecycleManager, LifecycleStats};
use crate::namespace::{EntryKind, NamespaceEntry, ResolvedNamespace, NAMESPACE_SEPARATOR};
use crate::session::{
    SessionIsolationManager, SessionStats, IDLE_SWEEP_INTERVAL, MAX_IDLE,
};
use crate::transport::Connection;

pub use transform::{ToolTransform, TransformRules};

/// The request kinds the proxy routes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum RequestKind {
    #[serde(rename = "tools/call")]
    #[strum(serialize = "tools/call")]
    ToolsCall,
    #[serde(rename = "resources/read")]
    #[strum(serialize = "resources/read")]
    ResourcesRead,
    #[serde(rename = "tools/list")]
    #[strum(serialize = "tools/list")]
    ToolsList,
    #[serde(rename = "resources/list")]
    #[strum(serialize = "resources/list")]
    ResourcesList,
}

/// Wire-protocol seam. Implementations encode the request, send it over
/// the given connection, and decode the structured result.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        connection: &Connection,
        kind: RequestKind,
        payload: &Value,
    ) -> Result<Value>;
}

#[derive(Default)]
struct NamespaceState {
    tools: Vec<NamespaceEntry>,
    resources: Vec<NamespaceEntry>,
    resolved: ResolvedNamespace,
}

impl NamespaceState {
    fn other_entries(&self, kind: EntryKind) -> &[NamespaceEntry] {
        match kind {
            EntryKind::Tool => &self.resources,
            EntryKind::Resource => &self.tools,
        }
    }

    fn store(&mut self, kind: EntryKind, entries: Vec<NamespaceEntry>, resolved: ResolvedNamespace) {
        match kind {
            EntryKind::Tool => self.tools = entries,
            EntryKind::Resource => self.resources = entries,
        }
        self.resolved = resolved;
    }
}

/// Routing counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingStats {
    pub namespace_conflicts: usize,
    pub namespace_mappings: usize,
}

/// Point-in-time proxy statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub name: String,
    pub running: bool,
    pub registered_backends: usize,
    pub active_backends: usize,
    pub sessions: SessionStats,
    pub lifecycle: LifecycleStats,
    pub routing: RoutingStats,
}

/// The aggregating proxy: one virtual endpoint over the backend fleet.
pub struct ProxyServer {
    config: ProxyConfig,
    fleet: FleetSupervisor,
    sessions: SessionIsolationManager,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Arc<dyn RequestDispatcher>,
    transforms: TransformRules,
    namespace: Mutex<NamespaceState>,
    running: AtomicBool,
}

impl ProxyServer {
    pub fn new(
        config: ProxyConfig,
        credentials: Credentials,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Self {
        let fleet = FleetSupervisor::new(credentials);
        let lifecycle = Arc::new(LifecycleManager::new());
        let sessions = SessionIsolationManager::new(fleet.clone(), Arc::clone(&lifecycle));
        Self {
            config,
            fleet,
            sessions,
            lifecycle,
            dispatcher,
            transforms: TransformRules::new(),
            namespace: Mutex::new(NamespaceState::default()),
            running: AtomicBool::new(false),
        }
    }

    /// Install per-tool transformation rules.
    pub fn with_transforms(mut self, transforms: TransformRules) -> Self {
        self.transforms = transforms;
        self
    }

    /// Register every configured backend and start health monitoring.
    pub async fn initialize(&self) {
        tracing::info!(proxy = %self.config.name, "initializing proxy");
        self.fleet.initialize(&self.config.servers).await;
    }

    /// Start every backend and the idle sweeper.
    pub async fn start(&self) -> StartReport {
        tracing::info!(proxy = %self.config.name, "starting proxy");
        let report = self.fleet.start_all().await;
        self.sessions
            .spawn_sweeper(IDLE_SWEEP_INTERVAL, MAX_IDLE)
            .await;
        self.running.store(true, Ordering::SeqCst);
        report
    }

    /// Shut down: cancel both background loops, tear down every session,
    /// then every backend. Individual close failures are isolated and
    /// logged, never aborting the sequence.
    pub async fn stop(&self) {
        tracing::info!(proxy = %self.config.name, "stopping proxy");
        self.running.store(false, Ordering::SeqCst);
        self.sessions.shutdown().await;
        self.fleet.shutdown().await;
        tracing::info!(proxy = %self.config.name, "proxy stopped");
    }

    /// Handle one client request with session isolation.
    pub async fn handle_request(
        &self,
        client_id: &str,
        kind: RequestKind,
        payload: Value,
    ) -> Result<Value> {
        self.sessions.get_or_create(client_id).await;
        self.sessions
            .update_activity(
                client_id,
                Some(json!({ "type": kind.to_string(), "request": payload.clone() })),
            )
            .await;

        match self.route_request(client_id, kind, &payload).await {
            Ok(result) => {
                self.sessions.complete_request(client_id, None).await;
                Ok(result)
            }
            Err(e) => {
                tracing::error!(client_id, kind = %kind, error = %e, "error handling request");
                self.sessions
                    .fail_request(client_id, ErrorInfo::new("request_error", e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    async fn route_request(
        &self,
        client_id: &str,
        kind: RequestKind,
        payload: &Value,
    ) -> Result<Value> {
        match kind {
            RequestKind::ToolsCall => self.handle_tool_call(client_id, payload).await,
            RequestKind::ResourcesRead => self.handle_resource_read(client_id, payload).await,
            RequestKind::ToolsList => {
                self.handle_listing(client_id, EntryKind::Tool, kind, payload).await
            }
            RequestKind::ResourcesList => {
                self.handle_listing(client_id, EntryKind::Resource, kind, payload)
                    .await
            }
        }
    }

    async fn handle_tool_call(&self, client_id: &str, payload: &Value) -> Result<Value> {
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| TychoError::InvalidRequest("tools/call requires a 'name'".into()))?
            .to_string();

        let payload = self.transforms.apply(&name, payload);
        let backend = self.resolve_backend(&name).await?;
        let handle = self.session_handle(client_id, &backend).await?;
        let forwarded = strip_namespace_prefix(payload, "name", &backend);
        self.dispatcher
            .dispatch(&handle, RequestKind::ToolsCall, &forwarded)
            .await
    }

    async fn handle_resource_read(&self, client_id: &str, payload: &Value) -> Result<Value> {
        let uri = payload
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| TychoError::InvalidRequest("resources/read requires a 'uri'".into()))?
            .to_string();

        let backend = self.resolve_backend(&uri).await?;
        let handle = self.session_handle(client_id, &backend).await?;
        let forwarded = strip_namespace_prefix(payload.clone(), "uri", &backend);
        self.dispatcher
            .dispatch(&handle, RequestKind::ResourcesRead, &forwarded)
            .await
    }

    /// Aggregate one listing kind across every running backend, resolve
    /// name conflicts over the union of tools and resources, and keep the
    /// result as the latest successful aggregation for routing.
    async fn handle_listing(
        &self,
        client_id: &str,
        entry_kind: EntryKind,
        kind: RequestKind,
        payload: &Value,
    ) -> Result<Value> {
        let key = match entry_kind {
            EntryKind::Tool => "tools",
            EntryKind::Resource => "resources",
        };

        let mut entries = Vec::new();
        let mut items = Vec::new();
        for backend in self.fleet.running_backends().await {
            let Some(handle) = self.sessions.backend_handle(client_id, &backend).await else {
                tracing::debug!(client_id, backend = %backend, "backend unavailable to session, skipping listing");
                continue;
            };
            match self.dispatcher.dispatch(&handle, kind, payload).await {
                Ok(result) => {
                    let Some(list) = result.get(key).and_then(Value::as_array) else {
                        tracing::warn!(backend = %backend, "listing response missing '{key}' array");
                        continue;
                    };
                    for item in list {
                        let Some(name) = item.get("name").and_then(Value::as_str) else {
                            tracing::warn!(backend = %backend, "skipping unnamed listing item");
                            continue;
                        };
                        entries.push(NamespaceEntry::new(name, entry_kind, &backend));
                        items.push(item.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "listing failed, omitting backend");
                }
            }
        }

        let published = {
            let mut state = self.namespace.lock().await;
            let union: Vec<NamespaceEntry> = entries
                .iter()
                .cloned()
                .chain(state.other_entries(entry_kind).iter().cloned())
                .collect();
            let resolved = ResolvedNamespace::resolve(union)?;
            let published: Vec<String> = resolved
                .entries()
                .iter()
                .take(entries.len())
                .map(|entry| entry.name.clone())
                .collect();
            state.store(entry_kind, entries, resolved);
            published
        };

        let rebuilt: Vec<Value> = items
            .into_iter()
            .zip(published)
            .map(|(mut item, name)| {
                if let Some(object) = item.as_object_mut() {
                    object.insert("name".to_string(), json!(name));
                }
                item
            })
            .collect();
        Ok(json!({ key: rebuilt }))
    }

    async fn resolve_backend(&self, name: &str) -> Result<String> {
        self.namespace.lock().await.resolved.resolve_server(name)
    }

    async fn session_handle(&self, client_id: &str, backend: &str) -> Result<Arc<Connection>> {
        self.sessions
            .backend_handle(client_id, backend)
            .await
            .ok_or_else(|| TychoError::connection(backend, "no session handle for backend"))
    }

    pub fn fleet(&self) -> &FleetSupervisor {
        &self.fleet
    }

    pub fn sessions(&self) -> &SessionIsolationManager {
        &self.sessions
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Point-in-time statistics; a pure read.
    pub async fn stats(&self) -> ProxyStats {
        let routing = {
            let state = self.namespace.lock().await;
            RoutingStats {
                namespace_conflicts: state.resolved.conflicts().len(),
                namespace_mappings: state.resolved.mapping_count(),
            }
        };
        ProxyStats {
            name: self.config.name.clone(),
            running: self.running.load(Ordering::SeqCst),
            registered_backends: self.fleet.status_all().await.len(),
            active_backends: self.fleet.running_backends().await.len(),
            sessions: self.sessions.stats().await,
            lifecycle: self.lifecycle.stats().await,
            routing,
        }
    }
}

/// Rewrite `field` without this backend's namespace prefix before the
/// payload is forwarded; backends only know their own raw names.
fn strip_namespace_prefix(mut payload: Value, field: &str, backend: &str) -> Value {
    let prefix = format!("{backend}{NAMESPACE_SEPARATOR}");
    if let Some(object) = payload.as_object_mut() {
        let stripped = object
            .get(field)
            .and_then(Value::as_str)
            .and_then(|value| value.strip_prefix(&prefix))
            .map(str::to_string);
        if let Some(stripped) = stripped {
            object.insert(field.to_string(), json!(stripped));
        }
    }
    payload
}
