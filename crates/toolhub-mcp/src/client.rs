//! MCP protocol client.
//!
//! `McpConnection` drives one handshake-completed protocol session over a
//! single transport. It is never reused across reconnects; the owning
//! session builds a new one each time.
//!
//! Requests are multiplexed: each one registers a waiter under its id, and a
//! reader task routes responses and progress notifications to the matching
//! waiter. A slow `tools/call` therefore never delays a listing sent after it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{McpError, TransportError};
use crate::protocol::{
    CallToolParams, CallToolResult, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsParams,
    ListToolsResult, McpToolDefinition, ProgressParams, RequestId, RequestMeta, ServerInfo,
    PROGRESS_NOTIFICATION,
};
use crate::transport::Transport;

type Reply = Result<JsonRpcResponse<Value>, TransportError>;

/// A request waiting for its response.
struct Waiter {
    reply: oneshot::Sender<Reply>,
    progress: mpsc::UnboundedSender<ProgressParams>,
}

/// Requests in flight, keyed by id.
#[derive(Default)]
struct PendingRequests {
    waiters: HashMap<RequestId, Waiter>,
    /// Why the reader stopped; set once, after which nothing is answered.
    closed: Option<TransportError>,
}

impl PendingRequests {
    fn register(
        &mut self,
        id: RequestId,
    ) -> Result<(oneshot::Receiver<Reply>, mpsc::UnboundedReceiver<ProgressParams>), TransportError> {
        if let Some(ref error) = self.closed {
            return Err(error.clone());
        }
        let (reply, reply_rx) = oneshot::channel();
        let (progress, progress_rx) = mpsc::unbounded_channel();
        self.waiters.insert(id, Waiter { reply, progress });
        Ok((reply_rx, progress_rx))
    }

    /// Fail every waiter and refuse new ones.
    fn shut(&mut self, error: TransportError) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.reply.send(Err(error.clone()));
        }
        self.closed.get_or_insert(error);
    }
}

/// Removes a waiter when its request finishes or is abandoned.
struct Registration<'a> {
    pending: &'a Mutex<PendingRequests>,
    id: RequestId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.lock().waiters.remove(&self.id);
    }
}

/// A connection to a single MCP server.
pub struct McpConnection {
    /// Server id this connection belongs to.
    name: String,
    /// Transport for communication.
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingRequests>>,
    /// Task routing incoming messages to waiters.
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Handshake result.
    server: RwLock<Option<InitializeResult>>,
    /// Tools from the last successful listing.
    cached_tools: RwLock<Option<Vec<McpToolDefinition>>>,
    /// Request ID counter.
    request_counter: AtomicU64,
    /// Upper bound for handshake and listing requests.
    request_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl McpConnection {
    /// Create a new connection with an existing transport.
    ///
    /// Spawns the reader task, so this must run inside a Tokio runtime.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending = Arc::new(Mutex::new(PendingRequests::default()));
        let reader = tokio::spawn(read_loop(
            name.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending),
        ));

        Self {
            name,
            transport,
            pending,
            reader: Mutex::new(Some(reader)),
            server: RwLock::new(None),
            cached_tools: RwLock::new(None),
            request_counter: AtomicU64::new(1),
            request_timeout: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Bound handshake and listing requests.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Get the server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.server.read().is_some()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Server identity reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server.read().as_ref().map(|r| r.server_info.clone())
    }

    /// Tools from the last `list_tools`, if any listing succeeded.
    pub fn cached_tools(&self) -> Option<Vec<McpToolDefinition>> {
        self.cached_tools.read().clone()
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    /// Generate a new request ID.
    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and wait for its response.
    ///
    /// With a timeout, the wait fails once `timeout` passes without a
    /// matching response; a progress notification carrying this request's
    /// token restarts the full window.
    async fn request<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Option<Duration>,
    ) -> Result<R, McpError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.request_with_id(self.next_request_id(), method, params, timeout)
            .await
    }

    async fn request_with_id<P, R>(
        &self,
        id: u64,
        method: &str,
        params: Option<P>,
        timeout: Option<Duration>,
    ) -> Result<R, McpError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut deadline = timeout.map(|t| Instant::now() + t);

        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;
        let key = RequestId::from(id);

        let (mut reply, mut progress) = self.pending.lock().register(key.clone())?;
        let _registration = Registration {
            pending: self.pending.as_ref(),
            id: key,
        };

        match deadline {
            Some(at) => tokio::time::timeout_at(at, self.transport.send(&request_json))
                .await
                .map_err(|_| timed_out(timeout))??,
            None => self.transport.send(&request_json).await?,
        }

        let response = loop {
            let expiry = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                outcome = &mut reply => {
                    break match outcome {
                        Ok(outcome) => outcome?,
                        Err(_) => return Err(TransportError::ConnectionClosed.into()),
                    };
                }
                Some(update) = progress.recv() => {
                    if let Some(window) = timeout {
                        deadline = Some(Instant::now() + window);
                        debug!(
                            server = %self.name,
                            progress = update.progress,
                            total = ?update.total,
                            "Progress received, deadline extended"
                        );
                    }
                }
                _ = expiry => return Err(timed_out(timeout)),
            }
        };

        if let Some(error) = response.error {
            return Err(McpError::server_error(error.code, error.message));
        }
        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("Failed to parse {} result: {}", method, e)))
    }

    /// Send a notification (no response expected).
    async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<(), McpError>
    where
        P: serde::Serialize,
    {
        let notification = JsonRpcNotification::new(method, params);
        let notification_json = serde_json::to_string(&notification)?;

        self.transport.send(&notification_json).await?;

        Ok(())
    }

    /// Perform the initialize handshake.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        if self.is_initialized() {
            return Err(McpError::init_failed("connection already initialized"));
        }

        debug!(server = %self.name, "Initializing MCP connection");

        let result: InitializeResult = self
            .request("initialize", Some(InitializeParams::default()), self.request_timeout)
            .await
            .map_err(|e| match e {
                McpError::ServerError { message, .. } => McpError::init_failed(message),
                other => other,
            })?;

        self.notify::<()>("notifications/initialized", None).await?;

        info!(
            server = %self.name,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP connection initialized"
        );

        *self.server.write() = Some(result.clone());
        Ok(result)
    }

    /// List every tool the server offers, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        if !self.is_initialized() {
            return Err(McpError::NotConnected(self.name.clone()));
        }

        debug!(server = %self.name, "Listing tools");

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = ListToolsParams {
                cursor: cursor.clone(),
            };
            let page: ListToolsResult = self
                .request("tools/list", Some(params), self.request_timeout)
                .await?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(server = %self.name, cursor = %next, "Server repeated a cursor, stopping");
                    break;
                }
                None => break,
            }
        }

        debug!(server = %self.name, tool_count = tools.len(), "Listed tools");

        *self.cached_tools.write() = Some(tools.clone());
        Ok(tools)
    }

    /// Call a tool on the server.
    ///
    /// `timeout` is an inactivity window, restarted by progress notifications.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult, McpError> {
        if !self.is_initialized() {
            return Err(McpError::NotConnected(self.name.clone()));
        }

        debug!(server = %self.name, tool = name, "Calling tool");

        // The request id doubles as the progress token
        let id = self.next_request_id();
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
            meta: Some(RequestMeta {
                progress_token: RequestId::from(id),
            }),
        };

        let result: CallToolResult = self
            .request_with_id(id, "tools/call", Some(params), timeout)
            .await?;

        if result.is_error {
            warn!(server = %self.name, tool = name, "Tool returned error");
        }

        Ok(result)
    }

    /// Close the connection.
    ///
    /// Requests still waiting fail with a transport error.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!(server = %self.name, "Closing MCP connection");

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.pending.lock().shut(TransportError::NotConnected);
        self.transport.close().await?;

        info!(server = %self.name, "MCP connection closed");

        Ok(())
    }
}

impl Drop for McpConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

/// Route every incoming message until the transport stops.
async fn read_loop(
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<PendingRequests>>,
) {
    loop {
        let raw = match transport.receive().await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(server = %name, error = %e, "Reader stopped");
                pending.lock().shut(e);
                return;
            }
        };

        let message = match IncomingMessage::parse(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(server = %name, error = %e, "Skipping unparseable message");
                continue;
            }
        };

        match message {
            IncomingMessage::Response(response) => {
                let waiter = pending.lock().waiters.remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.reply.send(Ok(response));
                    }
                    None => debug!(server = %name, id = ?response.id, "Ignoring stale response"),
                }
            }
            IncomingMessage::Notification(notification)
                if notification.method == PROGRESS_NOTIFICATION =>
            {
                let Some(update) = notification
                    .params
                    .and_then(|p| serde_json::from_value::<ProgressParams>(p).ok())
                else {
                    debug!(server = %name, "Ignoring malformed progress notification");
                    continue;
                };
                let waiters = pending.lock();
                match waiters.waiters.get(&update.progress_token) {
                    Some(waiter) => {
                        let _ = waiter.progress.send(update);
                    }
                    None => debug!(server = %name, token = ?update.progress_token, "Ignoring progress for finished request"),
                }
            }
            IncomingMessage::Notification(notification) => {
                debug!(server = %name, method = %notification.method, "Ignoring notification");
            }
            IncomingMessage::Request(request) => {
                // Sampling, roots and elicitation are not offered to servers
                debug!(server = %name, method = %request.method, "Rejecting server request");
                let reply: JsonRpcResponse<Value> = JsonRpcResponse {
                    jsonrpc: request.jsonrpc,
                    id: request.id,
                    result: None,
                    error: Some(JsonRpcError {
                        code: JsonRpcError::METHOD_NOT_FOUND,
                        message: format!("Method not supported: {}", request.method),
                        data: None,
                    }),
                };
                match serde_json::to_string(&reply) {
                    Ok(reply_json) => {
                        if let Err(e) = transport.send(&reply_json).await {
                            warn!(server = %name, error = %e, "Failed to reject server request");
                        }
                    }
                    Err(e) => warn!(server = %name, error = %e, "Failed to encode rejection"),
                }
            }
        }
    }
}

fn timed_out(timeout: Option<Duration>) -> McpError {
    McpError::Timeout(timeout.map(|t| t.as_secs()).unwrap_or_default())
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("name", &self.name)
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryServer, ToolBehavior};
    use crate::protocol::ToolContent;
    use crate::transport::TransportFactory;

    async fn connect(server: &InMemoryServer) -> McpConnection {
        let transport = server.factory().create().await.unwrap();
        let connection = McpConnection::new("mem", transport);
        connection.initialize().await.unwrap();
        connection
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let server = InMemoryServer::new("memory-server");
        let connection = connect(&server).await;

        assert!(connection.is_initialized());
        assert_eq!(connection.server_info().unwrap().name, "memory-server");
        assert!(connection.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursors() {
        let server = InMemoryServer::new("paged").with_page_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            server.add_tool(McpToolDefinition::new(name, "tool"), ToolBehavior::echo());
        }
        let connection = connect(&server).await;

        assert!(connection.cached_tools().is_none());
        let tools = connection.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(connection.cached_tools().unwrap().len(), 5);
        assert_eq!(server.method_count("tools/list"), 3);
    }

    #[tokio::test]
    async fn test_call_tool_returns_content() {
        let server = InMemoryServer::new("echo");
        server.add_tool(McpToolDefinition::new("echo", "Echo input"), ToolBehavior::echo());
        let connection = connect(&server).await;

        let result = connection
            .call_tool("echo", Some(serde_json::json!({"msg": "hi"})), None)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, vec![ToolContent::text(r#"{"msg":"hi"}"#)]);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_server_error() {
        let server = InMemoryServer::new("empty");
        let connection = connect(&server).await;

        let err = connection.call_tool("missing", None, None).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: JsonRpcError::INVALID_PARAMS, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_call_deadline() {
        let server = InMemoryServer::new("slow");
        server.add_tool(
            McpToolDefinition::new("crunch", "Long running"),
            ToolBehavior::progress(Duration::from_millis(80), 4, CallToolResult {
                content: vec![ToolContent::text("done")],
                structured_content: None,
                is_error: false,
            }),
        );
        let connection = connect(&server).await;

        // 5 gaps of 80ms = 400ms total, never 100ms of silence
        let result = connection
            .call_tool("crunch", None, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(result.content[0].as_text(), Some("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_call_times_out() {
        let server = InMemoryServer::new("stuck");
        server.add_tool(
            McpToolDefinition::new("hang", "Never answers in time"),
            ToolBehavior::delayed(Duration::from_secs(10), ToolBehavior::echo()),
        );
        let connection = connect(&server).await;

        let err = connection
            .call_tool("hang", None, Some(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_is_not_queued_behind_a_long_call() {
        let server = InMemoryServer::new("busy");
        server.add_tool(
            McpToolDefinition::new("hang", "Slow"),
            ToolBehavior::delayed(Duration::from_secs(300), ToolBehavior::echo()),
        );
        let transport = server.factory().create().await.unwrap();
        let connection =
            Arc::new(McpConnection::new("mem", transport).with_request_timeout(Duration::from_secs(5)));
        connection.initialize().await.unwrap();

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.call_tool("hang", None, None).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(connection.in_flight(), 1);

        let start = Instant::now();
        let tools = connection.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!call.is_finished());

        let result = call.await.unwrap().unwrap();
        assert!(!result.is_error);
        assert!(start.elapsed() >= Duration::from_secs(300));
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_fails_calls_in_flight() {
        let server = InMemoryServer::new("fragile");
        server.add_tool(
            McpToolDefinition::new("hang", "Slow"),
            ToolBehavior::delayed(Duration::from_secs(300), ToolBehavior::echo()),
        );
        let connection = Arc::new(connect(&server).await);

        let call = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move { connection.call_tool("hang", None, None).await }
        });
        tokio::task::yield_now().await;

        let start = Instant::now();
        server.sever();
        let err = call.await.unwrap().unwrap_err();
        assert!(err.is_transport());
        assert!(start.elapsed() < Duration::from_secs(1));

        // Nothing is accepted once the reader has stopped
        let err = connection.call_tool("hang", None, None).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = InMemoryServer::new("closer");
        let connection = connect(&server).await;

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert!(connection.is_closed());
    }
}
