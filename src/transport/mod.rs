//! Backend transport connectors.
//!
//! One connector per transport kind, behind the [`Connector`] seam. Stdio
//! connectors own a child process; http/sse connectors only record the
//! target — the external protocol client connects lazily.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{Credentials, ServerConfig, TransportType};
use crate::error::{Result, TychoError};
use crate::util::RetryPolicy;

/// Bounded wait for graceful termination before a forced kill.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Opaque live connection to one backend.
///
/// Held behind `Arc` by the fleet table and by each session's private
/// handle table. `shutdown` is idempotent, so a handle is torn down exactly
/// once no matter how many owners observed it.
pub struct Connection {
    backend: String,
    detail: ConnectionDetail,
    info: HashMap<String, String>,
}

enum ConnectionDetail {
    Stdio { child: Mutex<Option<Child>> },
    Remote,
}

impl Connection {
    fn stdio(backend: String, child: Child, info: HashMap<String, String>) -> Self {
        Self {
            backend,
            detail: ConnectionDetail::Stdio {
                child: Mutex::new(Some(child)),
            },
            info,
        }
    }

    fn remote(backend: String, info: HashMap<String, String>) -> Self {
        Self {
            backend,
            detail: ConnectionDetail::Remote,
            info,
        }
    }

    /// Name of the backend this connection belongs to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Connection info (pid/command for stdio, url for http/sse).
    pub fn info(&self) -> &HashMap<String, String> {
        &self.info
    }

    /// Whether the underlying process has exited.
    ///
    /// Remote connections cannot be probed here and always report alive;
    /// their failures surface through the dispatch boundary instead.
    pub async fn is_terminated(&self) -> bool {
        match &self.detail {
            ConnectionDetail::Remote => false,
            ConnectionDetail::Stdio { child } => match child.lock().await.as_mut() {
                None => true,
                Some(child) => child.try_wait().map(|status| status.is_some()).unwrap_or(false),
            },
        }
    }

    /// Tear the connection down, waiting up to `grace` for a clean exit.
    ///
    /// Closing stdin asks a well-behaved stdio server to exit; past the
    /// grace period the process is killed. Subsequent calls are no-ops.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let ConnectionDetail::Stdio { child } = &self.detail else {
            return Ok(());
        };
        let Some(mut child) = child.lock().await.take() else {
            return Ok(());
        };

        drop(child.stdin.take());
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TychoError::cleanup(&self.backend, e.to_string())),
            Err(_) => {
                tracing::warn!(backend = %self.backend, "backend did not exit gracefully, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| TychoError::cleanup(&self.backend, e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("backend", &self.backend)
            .field("info", &self.info)
            .finish()
    }
}

/// Transport seam between the supervisor/session layers and one backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh connection to the configured backend.
    async fn connect(&self, config: &ServerConfig) -> Result<Connection>;

    /// Close a connection produced by this connector.
    async fn close(&self, connection: &Connection) -> Result<()>;
}

/// Stdio connector: spawns the configured command with pipes attached.
pub struct StdioConnector {
    credentials: Credentials,
}

impl StdioConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection> {
        let Some((program, program_args)) = config.command.split_first() else {
            return Err(TychoError::Configuration(format!(
                "stdio transport requires a command for server '{}'",
                config.name
            )));
        };

        // Subprocess environment is credentials overlaid with the
        // descriptor's own env, replacing the inherited environment.
        let mut env = self.credentials.clone();
        env.extend(config.env.clone());

        let child = Command::new(program)
            .args(program_args)
            .args(&config.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TychoError::connection(&config.name, format!("failed to spawn: {e}")))?;

        let mut info = HashMap::new();
        if let Some(pid) = child.id() {
            info.insert("pid".to_string(), pid.to_string());
        }
        info.insert("command".to_string(), config.command.join(" "));
        tracing::debug!(backend = %config.name, pid = ?child.id(), "started stdio backend");

        Ok(Connection::stdio(config.name.clone(), child, info))
    }

    async fn close(&self, connection: &Connection) -> Result<()> {
        connection.shutdown(GRACEFUL_SHUTDOWN).await
    }
}

/// Http connector: records the target for the lazily-connecting client.
pub struct HttpConnector;

/// Sse connector: records the target for the lazily-connecting client.
pub struct SseConnector;

fn remote_connection(config: &ServerConfig, transport: TransportType) -> Result<Connection> {
    let Some(url) = config.url.as_deref() else {
        return Err(TychoError::Configuration(format!(
            "{transport} transport requires a url for server '{}'",
            config.name
        )));
    };

    let mut info = HashMap::new();
    info.insert("url".to_string(), url.to_string());
    info.insert("transport".to_string(), transport.to_string());
    tracing::debug!(backend = %config.name, url, "recorded {transport} backend target");

    Ok(Connection::remote(config.name.clone(), info))
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection> {
        remote_connection(config, TransportType::Http)
    }

    async fn close(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection> {
        remote_connection(config, TransportType::Sse)
    }

    async fn close(&self, _connection: &Connection) -> Result<()> {
        Ok(())
    }
}

/// Build the connector for a server, validating its configuration eagerly.
pub fn connector_for(
    config: &ServerConfig,
    credentials: &Credentials,
) -> Result<Box<dyn Connector>> {
    match config.transport {
        TransportType::Stdio => {
            if config.command.is_empty() {
                return Err(TychoError::Configuration(format!(
                    "stdio transport requires a command for server '{}'",
                    config.name
                )));
            }
            Ok(Box::new(StdioConnector::new(credentials.clone())))
        }
        TransportType::Http | TransportType::Sse => {
            if config.url.is_none() {
                return Err(TychoError::Configuration(format!(
                    "{} transport requires a url for server '{}'",
                    config.transport, config.name
                )));
            }
            match config.transport {
                TransportType::Http => Ok(Box::new(HttpConnector)),
                _ => Ok(Box::new(SseConnector)),
            }
        }
    }
}

/// Connect to a backend: eager validation, then bounded connect retries at
/// the descriptor's cadence.
pub async fn establish(config: &ServerConfig, credentials: &Credentials) -> Result<Connection> {
    let connector = connector_for(config, credentials)?;
    let policy = RetryPolicy::for_server(config);
    policy.execute(|| connector.connect(config)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::from([("API_KEY".to_string(), "secret".to_string())])
    }

    #[test]
    fn connector_for_rejects_stdio_without_command() {
        let config = ServerConfig::stdio("search", Vec::new());
        let err = connector_for(&config, &creds())
            .err()
            .expect("missing command should be rejected");
        assert!(matches!(err, TychoError::Configuration(_)));
    }

    #[test]
    fn connector_for_rejects_http_without_url() {
        let mut config = ServerConfig::http("weather", "http://localhost/mcp");
        config.url = None;
        let err = connector_for(&config, &creds())
            .err()
            .expect("missing url should be rejected");
        assert!(matches!(err, TychoError::Configuration(_)));
    }

    #[tokio::test]
    async fn remote_connections_record_the_target() {
        let config = ServerConfig::sse("events", "http://localhost:9000/sse");
        let connection = establish(&config, &creds())
            .await
            .expect("sse connect records the target without network IO");

        assert_eq!(connection.backend(), "events");
        assert_eq!(
            connection.info().get("url").map(String::as_str),
            Some("http://localhost:9000/sse")
        );
        assert!(!connection.is_terminated().await);
        connection
            .shutdown(GRACEFUL_SHUTDOWN)
            .await
            .expect("remote shutdown is a no-op");
    }

    #[tokio::test]
    async fn stdio_connect_spawns_and_shutdown_reaps() {
        let config = ServerConfig::stdio(
            "cat",
            vec!["/bin/sh".to_string(), "-c".to_string(), "cat".to_string()],
        );
        let connection = establish(&config, &creds())
            .await
            .expect("sh should spawn");

        assert!(connection.info().contains_key("pid"));
        assert!(!connection.is_terminated().await);

        connection
            .shutdown(GRACEFUL_SHUTDOWN)
            .await
            .expect("cat exits when stdin closes");
        assert!(connection.is_terminated().await);

        // Second shutdown is a no-op.
        connection
            .shutdown(GRACEFUL_SHUTDOWN)
            .await
            .expect("repeated shutdown should be idempotent");
    }

    #[tokio::test]
    async fn stdio_spawn_failure_is_a_connection_error() {
        let mut config = ServerConfig::stdio(
            "broken",
            vec!["/nonexistent/tycho-test-binary".to_string()],
        );
        config.retry_attempts = 1;

        let err = establish(&config, &creds())
            .await
            .expect_err("missing binary should fail to spawn");
        assert!(matches!(err, TychoError::Connection { backend, .. } if backend == "broken"));
    }
}
