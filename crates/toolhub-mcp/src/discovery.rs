//! Session lifecycle management.
//!
//! `SessionManager` turns configured servers into [`SessionClient`]s, keeps
//! the shared session registry and running-status map up to date, and stops
//! everything on shutdown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, error, info};

use toolhub_core::{Config, HealthSettings, ServerConfig, TransportConfig};

use crate::error::McpError;
use crate::monitor::{ConnectionState, ReconnectConfig};
use crate::registry::{RunningStatus, SessionRegistry};
use crate::session::{HealthTarget, SessionClient, SessionConfig};
use crate::transport::{HttpTransportFactory, StdioTransportFactory, TransportFactory};

/// Build the transport factory described by a server's configuration.
pub fn factory_for(server: &ServerConfig, request_timeout: Duration) -> Arc<dyn TransportFactory> {
    match &server.transport {
        TransportConfig::Stdio {
            command,
            args,
            env,
            working_dir,
        } => Arc::new(StdioTransportFactory {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
            working_dir: working_dir.clone(),
        }),
        TransportConfig::Http { url, .. } => Arc::new(HttpTransportFactory {
            url: url.clone(),
            credential: server.resolve_credential(),
            connect_timeout: request_timeout,
        }),
    }
}

/// Outcome of [`SessionManager::start_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

/// Owns the lifecycle of every backend session.
pub struct SessionManager {
    sessions: SessionRegistry,
    status: RunningStatus,
    reconnect: ReconnectConfig,
    health: HealthSettings,
    call_timeout: Duration,
}

impl SessionManager {
    pub fn new(config: &Config) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            status: RunningStatus::new(),
            reconnect: ReconnectConfig::from(&config.reconnect),
            health: config.health.clone(),
            call_timeout: config.catalog.call_timeout(),
        }
    }

    /// Shared handle to the live-session registry.
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Shared handle to the running-status map.
    pub fn running_status(&self) -> RunningStatus {
        self.status.clone()
    }

    /// Session configuration for a server.
    pub fn session_config(&self, server: &ServerConfig) -> SessionConfig {
        let mut config = SessionConfig::new(&server.id, &server.name)
            .with_reconnect(self.reconnect)
            .with_call_timeout(self.call_timeout);

        if let Some(ref url) = server.health_check_url {
            let target = HealthTarget::Http {
                url: url.clone(),
                credential: server.resolve_credential(),
            };
            config = config.with_health(target, &self.health);
        }
        config
    }

    /// Register a session for `server` using its configured transport.
    pub fn register(&self, server: &ServerConfig) -> SessionClient {
        let config = self.session_config(server);
        let factory = factory_for(server, config.request_timeout);
        self.register_with_factory(server, factory)
    }

    /// Register a session for `server` over a caller-provided transport.
    ///
    /// Any session already registered under the same id is disposed.
    pub fn register_with_factory(
        &self,
        server: &ServerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> SessionClient {
        let status = self.status.clone();
        let name = server.name.clone();
        let observer = Arc::new(move |state: ConnectionState| match state {
            ConnectionState::Connected => status.set(name.clone(), true),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                status.set(name.clone(), false)
            }
            // Still running while a handshake or recovery is under way
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        });

        let session =
            SessionClient::with_state_observer(self.session_config(server), factory, observer);
        if let Some(previous) = self.sessions.insert(session.clone()) {
            debug!(server = %server.id, "Replacing registered session");
            tokio::spawn(async move { previous.dispose().await });
        }
        session
    }

    /// Register and connect every enabled server concurrently.
    ///
    /// A server that fails to connect is logged and reported; it never stops
    /// the others.
    pub async fn start_all(&self, servers: &[ServerConfig]) -> StartReport {
        let mut report = StartReport::default();
        let mut pending = Vec::new();

        info!(count = servers.len(), "Starting MCP sessions");

        for server in servers {
            if !server.enabled {
                debug!(server = %server.id, "Skipping disabled server");
                report.skipped.push(server.id.clone());
                continue;
            }
            let session = self.register(server);
            pending.push(async move {
                let outcome = session.connect().await;
                (session, outcome)
            });
        }

        for (session, outcome) in join_all(pending).await {
            match outcome {
                Ok(()) => report.started.push(session.server_id().to_string()),
                Err(e) => {
                    error!(server = %session.server_id(), error = %e, "Failed to start session");
                    report.failed.push(session.server_id().to_string());
                }
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "MCP sessions started"
        );

        report
    }

    /// Connect one registered session.
    pub async fn start_server(&self, server_id: &str) -> Result<(), McpError> {
        let session = self
            .sessions
            .get(server_id)
            .ok_or_else(|| McpError::NotConnected(server_id.to_string()))?;
        session.connect().await
    }

    /// Dispose one session and forget it.
    pub async fn stop_server(&self, server_id: &str) {
        if let Some(session) = self.sessions.remove(server_id) {
            session.dispose().await;
            self.status.set(session.server_name(), false);
        }
    }

    /// Dispose every session.
    pub async fn stop_all(&self) {
        info!("Stopping all MCP sessions");
        let sessions = self.sessions.drain();
        join_all(sessions.iter().map(|s| s.dispose())).await;
        for session in &sessions {
            self.status.set(session.server_name(), false);
        }
    }

    /// Status of one server.
    pub fn server_status(&self, server_id: &str) -> ServerStatus {
        match self.sessions.get(server_id) {
            Some(session) => ServerStatus::Session {
                state: session.state(),
                tool_count: session.cached_tools().map(|t| t.len()),
            },
            None => ServerStatus::Unregistered,
        }
    }
}

/// Status of a configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// No session exists for the server.
    Unregistered,
    /// A session exists.
    Session {
        state: ConnectionState,
        /// Tools from the last listing, if any.
        tool_count: Option<usize>,
    },
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Session {
                state,
                tool_count: Some(count),
            } => write!(f, "{} ({} tools)", state, count),
            Self::Session { state, .. } => write!(f, "{}", state),
        }
    }
}
