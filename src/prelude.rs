//! Convenient re-exports of the main proxy surface.

pub use crate::config::{Credentials, ProxyConfig, ServerConfig, TransportType};
pub use crate::error::{Result, TychoError};
pub use crate::fleet::{FleetSupervisor, ServerStatus, StartReport};
pub use crate::lifecycle::{
    LifecycleHook, LifecycleManager, SessionEvent, SessionEventKind,
};
pub use crate::namespace::{EntryKind, NamespaceEntry, ResolvedNamespace};
pub use crate::proxy::{ProxyServer, RequestDispatcher, RequestKind, ToolTransform, TransformRules};
pub use crate::session::{ClientSession, SessionIsolationManager};
pub use crate::transport::{Connection, Connector};
