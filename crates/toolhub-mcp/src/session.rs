//! Reconnecting MCP session.
//!
//! A [`SessionClient`] owns at most one [`McpConnection`] at a time. Every
//! reconnect builds a brand-new transport and connection; the previous pair
//! is closed (best effort) and dropped, never reused.
//!
//! Recovery has a single entry point: transport close/error observers and
//! health-check failures all feed the session's [`ConnectionMonitor`], whose
//! reconnect attempts call back into the session.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use toolhub_core::HealthSettings;

use crate::client::McpConnection;
use crate::error::{McpError, TransportError};
use crate::health::{HealthChecker, LivenessCheck, HttpLivenessCheck, DEFAULT_FAILURE_THRESHOLD};
use crate::monitor::{ConnectionMonitor, ConnectionState, ReconnectConfig, Reconnector, StateObserver};
use crate::protocol::{CallToolResult, McpToolDefinition};
use crate::transport::{TransportFactory, TransportObserver};

/// Where liveness checks go.
#[derive(Clone)]
pub enum HealthTarget {
    /// GET this URL, optionally with a bearer credential.
    Http {
        url: String,
        credential: Option<String>,
    },
    /// Any custom check.
    Custom(Arc<dyn LivenessCheck>),
}

impl HealthTarget {
    fn into_check(self) -> Arc<dyn LivenessCheck> {
        match self {
            Self::Http { url, credential } => Arc::new(HttpLivenessCheck::new(url, credential)),
            Self::Custom(check) => check,
        }
    }
}

impl fmt::Debug for HealthTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Never print the credential
            Self::Http { url, credential } => f
                .debug_struct("Http")
                .field("url", url)
                .field("credential", &credential.as_ref().map(|_| "***"))
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server id; doubles as the session id.
    pub server_id: String,
    pub server_name: String,
    pub reconnect: ReconnectConfig,
    /// Checks run only when a target is set.
    pub health_target: Option<HealthTarget>,
    pub health_interval: Duration,
    pub failure_threshold: u32,
    /// Upper bound for handshake and tool listing.
    pub request_timeout: Duration,
    /// Inactivity window for tool calls.
    pub call_timeout: Duration,
}

impl SessionConfig {
    pub fn new(server_id: impl Into<String>, server_name: impl Into<String>) -> Self {
        let health = HealthSettings::default();
        Self {
            server_id: server_id.into(),
            server_name: server_name.into(),
            reconnect: ReconnectConfig::default(),
            health_target: None,
            health_interval: health.interval(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            request_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_health(mut self, target: HealthTarget, settings: &HealthSettings) -> Self {
        self.health_target = Some(target);
        self.health_interval = settings.interval();
        self.failure_threshold = settings.failure_threshold;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

struct SessionInner {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    monitor: ConnectionMonitor,
    health: Option<HealthChecker>,
    connection: RwLock<Option<Arc<McpConnection>>>,
    /// Generation handed to the most recently built transport.
    next_generation: AtomicU64,
    /// Generation of the installed connection; 0 when none.
    installed_generation: AtomicU64,
    disposed: AtomicBool,
}

impl SessionInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.is_disposed() && self.installed_generation.load(Ordering::SeqCst) == generation
    }

    /// Build, observe and handshake a fresh transport. Does not install it.
    async fn establish(self: &Arc<Self>) -> Result<(Arc<McpConnection>, u64), McpError> {
        let id = &self.config.server_id;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;

        debug!(session = %id, generation, transport = %self.factory.describe(), "Building transport");
        let mut transport = self.factory.create().await?;
        transport.observers_mut().push(Arc::new(MonitorForwarder {
            session: Arc::downgrade(self),
            generation,
        }));

        let connection = Arc::new(
            McpConnection::new(id.clone(), transport).with_request_timeout(self.config.request_timeout),
        );
        if let Err(e) = connection.initialize().await {
            let _ = connection.close().await;
            return Err(e);
        }

        // Closing is asynchronous; dispose may have won the race
        if self.is_disposed() {
            let _ = connection.close().await;
            return Err(McpError::Disposed(id.clone()));
        }

        Ok((connection, generation))
    }

    fn install(&self, connection: Arc<McpConnection>, generation: u64) {
        *self.connection.write() = Some(connection);
        self.installed_generation.store(generation, Ordering::SeqCst);
    }

    fn uninstall(&self) -> Option<Arc<McpConnection>> {
        self.installed_generation.store(0, Ordering::SeqCst);
        self.connection.write().take()
    }

    fn start_health(&self) {
        if let Some(ref health) = self.health {
            health.start();
        }
    }

    fn stop_health(&self) {
        if let Some(ref health) = self.health {
            health.stop();
        }
    }

    async fn close_quietly(&self, connection: Arc<McpConnection>) {
        if let Err(e) = connection.close().await {
            debug!(session = %self.config.server_id, error = %e, "Ignoring close failure");
        }
    }

    /// Reconnect attempt driven by the monitor.
    async fn reconnect(self: &Arc<Self>) -> bool {
        if self.is_disposed() {
            return false;
        }
        self.stop_health();

        if let Some(old) = self.uninstall() {
            self.close_quietly(old).await;
        }
        if self.is_disposed() {
            return false;
        }

        match self.establish().await {
            Ok((connection, generation)) => {
                self.install(connection, generation);
                self.start_health();
                true
            }
            Err(e) => {
                warn!(session = %self.config.server_id, error = %e, "Reconnect attempt failed");
                false
            }
        }
    }

    fn on_unhealthy(&self) {
        if self.is_disposed() {
            return;
        }
        if self.monitor.state() == ConnectionState::Connected {
            warn!(session = %self.config.server_id, "Health checks failing, treating as connection loss");
            self.monitor.handle_connection_lost();
        }
    }
}

/// Forwards transport signals of one generation into the monitor.
struct MonitorForwarder {
    session: Weak<SessionInner>,
    generation: u64,
}

impl MonitorForwarder {
    fn current(&self) -> Option<Arc<SessionInner>> {
        self.session
            .upgrade()
            .filter(|inner| inner.is_current(self.generation))
    }
}

impl TransportObserver for MonitorForwarder {
    fn on_close(&self) {
        if let Some(inner) = self.current() {
            inner.monitor.handle_connection_lost();
        }
    }

    fn on_error(&self, error: &TransportError) {
        if let Some(inner) = self.current() {
            inner.monitor.handle_error(error);
        }
    }
}

struct SessionReconnector {
    session: Weak<SessionInner>,
}

#[async_trait]
impl Reconnector for SessionReconnector {
    async fn reconnect(&self) -> bool {
        match self.session.upgrade() {
            Some(inner) => inner.reconnect().await,
            None => false,
        }
    }
}

/// One logical, self-healing connection to a backend MCP server.
///
/// Clones share the same session.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<SessionInner>,
}

impl SessionClient {
    pub fn new(config: SessionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::build(config, factory, None)
    }

    /// Like [`SessionClient::new`], notifying `observer` of every state change.
    pub fn with_state_observer(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        observer: StateObserver,
    ) -> Self {
        Self::build(config, factory, Some(observer))
    }

    fn build(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        observer: Option<StateObserver>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let monitor = ConnectionMonitor::new(
                config.server_id.clone(),
                config.reconnect,
                Arc::new(SessionReconnector {
                    session: weak.clone(),
                }),
                observer,
            );

            let health = config.health_target.clone().map(|target| {
                let session = weak.clone();
                HealthChecker::new(config.server_id.clone(), target.into_check(), config.health_interval)
                    .with_failure_threshold(config.failure_threshold)
                    .on_unhealthy(Arc::new(move || {
                        if let Some(inner) = session.upgrade() {
                            inner.on_unhealthy();
                        }
                    }))
            });

            SessionInner {
                config,
                factory,
                monitor,
                health,
                connection: RwLock::new(None),
                next_generation: AtomicU64::new(0),
                installed_generation: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn server_name(&self) -> &str {
        &self.inner.config.server_name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.monitor.state()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Whether health checks are currently running.
    pub fn is_health_checking(&self) -> bool {
        self.inner.health.as_ref().is_some_and(|h| h.is_running())
    }

    /// The live connection, if one is installed.
    pub fn connection(&self) -> Option<Arc<McpConnection>> {
        self.inner.connection.read().clone()
    }

    /// Connect and handshake. Fails at once if the session was disposed.
    ///
    /// Refused while the monitor is reconnecting; the pending or running
    /// attempt is left alone.
    pub async fn connect(&self) -> Result<(), McpError> {
        let inner = &self.inner;
        let id = &inner.config.server_id;
        if inner.is_disposed() {
            return Err(McpError::Disposed(id.clone()));
        }
        if self.state() == ConnectionState::Connected && self.connection().is_some() {
            return Ok(());
        }

        if !inner.monitor.try_mark_connecting() {
            return Err(McpError::Reconnecting(id.clone()));
        }
        info!(session = %id, transport = %inner.factory.describe(), "Connecting");
        inner.stop_health();
        if let Some(old) = inner.uninstall() {
            inner.close_quietly(old).await;
        }

        match inner.establish().await {
            Ok((connection, generation)) => {
                inner.install(connection, generation);
                inner.monitor.mark_connected();
                inner.start_health();
                info!(session = %id, "Connected");
                Ok(())
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Connect failed");
                inner.monitor.mark_disconnected();
                Err(e)
            }
        }
    }

    fn require_connection(&self) -> Result<Arc<McpConnection>, McpError> {
        if self.is_disposed() {
            return Err(McpError::Disposed(self.server_id().to_string()));
        }
        self.connection()
            .ok_or_else(|| McpError::NotConnected(self.server_id().to_string()))
    }

    /// List tools on the current connection.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.require_connection()?.list_tools().await
    }

    /// Tools from the current connection's last listing.
    pub fn cached_tools(&self) -> Option<Vec<McpToolDefinition>> {
        self.connection().and_then(|c| c.cached_tools())
    }

    /// Call a tool using the configured call timeout.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult, McpError> {
        let timeout = self.inner.config.call_timeout;
        self.call_tool_with_timeout(name, arguments, timeout).await
    }

    /// Call a tool; `timeout` restarts on every progress notification.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        self.require_connection()?
            .call_tool(name, arguments, Some(timeout))
            .await
    }

    /// Stop health checks, cancel reconnects and close the connection.
    ///
    /// Terminal: a disposed session never connects again.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session = %inner.config.server_id, "Disposing session");

        inner.stop_health();
        inner.monitor.dispose();
        if let Some(connection) = inner.uninstall() {
            inner.close_quietly(connection).await;
        }
    }
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("server_id", &self.inner.config.server_id)
            .field("server_name", &self.inner.config.server_name)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
