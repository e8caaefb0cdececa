//! Validated configuration boundary.
//!
//! Parsing and validation happen upstream (CLI, config files, credential
//! discovery are out of scope); the proxy core only consumes these types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Credential map merged into stdio subprocess environments.
pub type Credentials = HashMap<String, String>;

/// Transport used to reach a backend server.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransportType {
    Stdio,
    Http,
    Sse,
}

/// Configuration for one backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique name for this server.
    pub name: String,
    pub transport: TransportType,
    /// Command vector for stdio servers (program followed by arguments).
    #[serde(default)]
    pub command: Vec<String>,
    /// Additional arguments appended after `command`.
    #[serde(default)]
    pub args: Vec<String>,
    /// URL for http/sse servers.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra environment variables for stdio servers; these win over
    /// credential-map entries on key clash.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Connection timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Connect attempts per start (including the first).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between connect attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Optional namespace hint for published tool/resource names.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl ServerConfig {
    /// A stdio backend launched from a command vector.
    pub fn stdio(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio,
            command,
            args: Vec::new(),
            url: None,
            env: HashMap::new(),
            enabled: true,
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            namespace: None,
        }
    }

    /// An http backend reached at `url`.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            transport: TransportType::Http,
            ..Self::stdio(name, Vec::new())
        }
    }

    /// An sse backend reached at `url`.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            transport: TransportType::Sse,
            ..Self::stdio(name, Vec::new())
        }
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_name")]
    pub name: String,
    /// Backend servers to aggregate. Names are unique (enforced upstream).
    pub servers: Vec<ServerConfig>,
}

fn default_proxy_name() -> String {
    "tycho".to_string()
}

impl ProxyConfig {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            name: default_proxy_name(),
            servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_config_deserializes_with_defaults() {
        let config: ServerConfig = serde_json::from_value(json!({
            "name": "search",
            "transport": "stdio",
            "command": ["mcp-search"]
        }))
        .expect("minimal stdio config should deserialize");

        assert!(config.enabled);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1000);
        assert!(config.namespace.is_none());
    }

    #[test]
    fn transport_type_round_trips_through_strings() {
        assert_eq!(TransportType::Stdio.to_string(), "stdio");
        assert_eq!(
            "sse".parse::<TransportType>().expect("sse should parse"),
            TransportType::Sse
        );
        assert!("grpc".parse::<TransportType>().is_err());
    }

    #[test]
    fn helpers_fill_the_transport_specific_fields() {
        let http = ServerConfig::http("weather", "http://localhost:9000/mcp");
        assert_eq!(http.transport, TransportType::Http);
        assert_eq!(http.url.as_deref(), Some("http://localhost:9000/mcp"));
        assert!(http.command.is_empty());
    }
}
