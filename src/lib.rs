//! Tycho — MCP aggregation proxy core.
//!
//! Aggregates a fleet of backend MCP servers behind one virtual endpoint:
//! a supervisor owns each backend's lifecycle and health, every client
//! identity gets its own isolated set of backend connections, and
//! colliding tool/resource names are disambiguated with `backend:name`
//! prefixes.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tycho::prelude::*;
//!
//! # async fn example(dispatcher: Arc<dyn RequestDispatcher>) -> tycho::error::Result<()> {
//! let config = ProxyConfig::new(vec![
//!     ServerConfig::stdio("files", vec!["mcp-files".into()]),
//!     ServerConfig::http("search", "http://localhost:9000/mcp"),
//! ]);
//! let proxy = ProxyServer::new(config, Credentials::new(), dispatcher);
//! proxy.initialize().await;
//! proxy.start().await;
//! let tools = proxy
//!     .handle_request("client-1", RequestKind::ToolsList, serde_json::json!({}))
//!     .await?;
//! # let _ = tools;
//! proxy.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod namespace;
pub mod prelude;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod util;
