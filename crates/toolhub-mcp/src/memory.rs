//! In-memory MCP server and transport.
//!
//! Hosts a scripted MCP server inside the process so sessions can be driven
//! without spawning children or opening sockets. Suitable for unit and
//! integration tests and for deterministic local flows. Each request's
//! replies are released on their own timer, measured on the tokio clock, so
//! a paused clock steps through them exactly and a slow call never holds
//! back the answers to other requests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::health::{LivenessCheck, LivenessResult};
use crate::protocol::{
    CallToolResult, JsonRpcError, McpToolDefinition, MCP_PROTOCOL_VERSION, PROGRESS_NOTIFICATION,
};
use crate::transport::{Transport, TransportFactory, TransportObservers};

/// How a hosted tool answers `tools/call`.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Reply with the call arguments rendered as text.
    Echo,
    /// Reply with a fixed result.
    Reply(CallToolResult),
    /// Reply with a JSON-RPC error.
    Fail { code: i32, message: String },
    /// Emit `ticks` progress notifications `interval` apart, then the result
    /// one more `interval` later.
    Progress {
        interval: Duration,
        ticks: u32,
        result: CallToolResult,
    },
    /// Hold the first reply message back by `delay`.
    Delayed {
        delay: Duration,
        then: Box<ToolBehavior>,
    },
}

impl ToolBehavior {
    pub fn echo() -> Self {
        Self::Echo
    }

    pub fn reply(result: CallToolResult) -> Self {
        Self::Reply(result)
    }

    pub fn fail(code: i32, message: impl Into<String>) -> Self {
        Self::Fail {
            code,
            message: message.into(),
        }
    }

    pub fn progress(interval: Duration, ticks: u32, result: CallToolResult) -> Self {
        Self::Progress {
            interval,
            ticks,
            result,
        }
    }

    pub fn delayed(delay: Duration, then: ToolBehavior) -> Self {
        Self::Delayed {
            delay,
            then: Box::new(then),
        }
    }

    fn script(&self, id: &Value, params: &Value) -> Vec<(Duration, Value)> {
        match self {
            Self::Echo => {
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let result = CallToolResult {
                    content: vec![crate::protocol::ToolContent::text(arguments.to_string())],
                    structured_content: None,
                    is_error: false,
                };
                vec![(Duration::ZERO, result_message(id, &result))]
            }
            Self::Reply(result) => vec![(Duration::ZERO, result_message(id, result))],
            Self::Fail { code, message } => {
                vec![(Duration::ZERO, error_message(id, *code, message))]
            }
            Self::Progress {
                interval,
                ticks,
                result,
            } => {
                let token = params
                    .pointer("/_meta/progressToken")
                    .cloned()
                    .unwrap_or_else(|| id.clone());
                let mut script: Vec<(Duration, Value)> = (1..=*ticks)
                    .map(|tick| {
                        let notification = json!({
                            "jsonrpc": "2.0",
                            "method": PROGRESS_NOTIFICATION,
                            "params": {
                                "progressToken": token,
                                "progress": tick,
                                "total": ticks,
                            },
                        });
                        (*interval, notification)
                    })
                    .collect();
                script.push((*interval, result_message(id, result)));
                script
            }
            Self::Delayed { delay, then } => {
                let mut script = then.script(id, params);
                if let Some(first) = script.first_mut() {
                    first.0 += *delay;
                }
                script
            }
        }
    }
}

fn result_message(id: &Value, result: &CallToolResult) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_message(id: &Value, code: i32, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

#[derive(Debug)]
struct HostedTool {
    definition: McpToolDefinition,
    behavior: ToolBehavior,
}

#[derive(Debug)]
struct ServerState {
    name: String,
    page_size: AtomicUsize,
    tools: RwLock<Vec<HostedTool>>,
    methods: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Value)>>,
    refusing: AtomicBool,
    healthy: AtomicBool,
    connections: AtomicUsize,
    current_link: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

/// Scripted MCP server living in the same process.
///
/// Cloning yields another handle to the same server.
#[derive(Debug, Clone)]
pub struct InMemoryServer {
    state: Arc<ServerState>,
}

impl InMemoryServer {
    /// Create a server with no tools that accepts connections.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ServerState {
                name: name.into(),
                page_size: AtomicUsize::new(0),
                tools: RwLock::new(Vec::new()),
                methods: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                refusing: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                connections: AtomicUsize::new(0),
                current_link: Mutex::new(None),
            }),
        }
    }

    /// Split `tools/list` into pages of `size` tools.
    pub fn with_page_size(self, size: usize) -> Self {
        self.state.page_size.store(size, Ordering::SeqCst);
        self
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn add_tool(&self, definition: McpToolDefinition, behavior: ToolBehavior) {
        let mut tools = self.state.tools.write();
        tools.retain(|t| t.definition.name != definition.name);
        tools.push(HostedTool {
            definition,
            behavior,
        });
    }

    /// Remove a tool by name.
    pub fn remove_tool(&self, name: &str) {
        self.state.tools.write().retain(|t| t.definition.name != name);
    }

    /// A factory that opens a fresh link to this server per connect.
    pub fn factory(&self) -> InMemoryTransportFactory {
        InMemoryTransportFactory {
            server: self.clone(),
        }
    }

    /// Drop the current link as if the peer process died.
    ///
    /// A receive parked on the link wakes at once; a later send fails.
    pub fn sever(&self) {
        if let Some(link) = self.state.current_link.lock().take() {
            link.send_replace(true);
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.state.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Set the answer of the health check.
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of transports created so far.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// How many times a method was received.
    pub fn method_count(&self, method: &str) -> usize {
        self.state.methods.lock().iter().filter(|m| *m == method).count()
    }

    /// Recorded `tools/call` invocations as (tool, arguments).
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.state.calls.lock().clone()
    }

    fn handle(&self, message: &Value) -> Vec<(Duration, Value)> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            // Reply to one of our (nonexistent) requests
            return Vec::new();
        };
        self.state.methods.lock().push(method.to_string());

        let Some(id) = message.get("id").filter(|id| !id.is_null()) else {
            return Vec::new();
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                let result = json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": self.state.name, "version": "0.0.0" },
                });
                vec![(Duration::ZERO, json!({ "jsonrpc": "2.0", "id": id, "result": result }))]
            }
            "ping" => vec![(Duration::ZERO, json!({ "jsonrpc": "2.0", "id": id, "result": {} }))],
            "tools/list" => vec![(Duration::ZERO, self.list_page(id, &params))],
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.state.calls.lock().push((name.to_string(), arguments));

                let behavior = self
                    .state
                    .tools
                    .read()
                    .iter()
                    .find(|t| t.definition.name == name)
                    .map(|t| t.behavior.clone());
                match behavior {
                    Some(behavior) => behavior.script(id, &params),
                    None => vec![(
                        Duration::ZERO,
                        error_message(id, JsonRpcError::INVALID_PARAMS, &format!("Unknown tool: {}", name)),
                    )],
                }
            }
            other => vec![(
                Duration::ZERO,
                error_message(id, JsonRpcError::METHOD_NOT_FOUND, &format!("Method not found: {}", other)),
            )],
        }
    }

    fn list_page(&self, id: &Value, params: &Value) -> Value {
        let tools = self.state.tools.read();
        let offset = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let page_size = match self.state.page_size.load(Ordering::SeqCst) {
            0 => tools.len().max(1),
            n => n,
        };

        let page: Vec<&McpToolDefinition> = tools
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|t| &t.definition)
            .collect();
        let next = offset + page.len();

        let mut result = json!({ "tools": page });
        if next < tools.len() {
            result["nextCursor"] = json!(next.to_string());
        }
        json!({ "jsonrpc": "2.0", "id": id, "result": result })
    }
}

#[async_trait]
impl LivenessCheck for InMemoryServer {
    async fn check(&self) -> LivenessResult {
        Ok(self.state.healthy.load(Ordering::SeqCst))
    }
}

/// Opens links to an [`InMemoryServer`].
#[derive(Debug, Clone)]
pub struct InMemoryTransportFactory {
    server: InMemoryServer,
}

#[async_trait]
impl TransportFactory for InMemoryTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        let state = &self.server.state;
        if state.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} refused the connection", state.name),
            )));
        }

        state.connections.fetch_add(1, Ordering::SeqCst);
        let (link, severed) = watch::channel(false);
        let link = Arc::new(link);
        *state.current_link.lock() = Some(Arc::clone(&link));
        let (outbox, messages) = mpsc::unbounded_channel();

        Ok(Box::new(InMemoryTransport {
            server: self.server.clone(),
            link,
            outbox,
            inbox: tokio::sync::Mutex::new(Inbox { messages, severed }),
            replies: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            observers: TransportObservers::default(),
        }))
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.server.state.name)
    }
}

struct Inbox {
    messages: mpsc::UnboundedReceiver<Value>,
    severed: watch::Receiver<bool>,
}

/// One link to an in-memory server.
pub struct InMemoryTransport {
    server: InMemoryServer,
    /// Set once the link is gone, by `sever` or `close`.
    link: Arc<watch::Sender<bool>>,
    outbox: mpsc::UnboundedSender<Value>,
    inbox: tokio::sync::Mutex<Inbox>,
    /// Timers still holding back delayed replies.
    replies: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    observers: TransportObservers,
}

impl InMemoryTransport {
    fn peer_closed(&self) -> TransportError {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.abort_replies();
            self.observers.notify_close();
        }
        TransportError::ConnectionClosed
    }

    fn check_link(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if *self.link.borrow() {
            return Err(self.peer_closed());
        }
        Ok(())
    }

    fn abort_replies(&self) {
        for reply in self.replies.lock().drain(..) {
            reply.abort();
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        self.check_link()?;
        let value: Value = serde_json::from_str(message).map_err(|e| {
            TransportError::WriteError(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let mut script = self.server.handle(&value).into_iter().peekable();
        while let Some((_, reply)) = script.next_if(|(delay, _)| delay.is_zero()) {
            let _ = self.outbox.send(reply);
        }
        let delayed: Vec<(Duration, Value)> = script.collect();
        if delayed.is_empty() {
            return Ok(());
        }

        let outbox = self.outbox.clone();
        let severed = self.link.subscribe();
        let reply = tokio::spawn(async move {
            for (delay, message) in delayed {
                tokio::time::sleep(delay).await;
                if *severed.borrow() || outbox.send(message).is_err() {
                    return;
                }
            }
        });

        let mut replies = self.replies.lock();
        replies.retain(|reply| !reply.is_finished());
        replies.push(reply);
        Ok(())
    }

    async fn receive(&self) -> Result<String, TransportError> {
        self.check_link()?;

        let mut inbox = self.inbox.lock().await;
        let Inbox { messages, severed } = &mut *inbox;
        loop {
            if *severed.borrow_and_update() {
                return Err(self.peer_closed());
            }
            tokio::select! {
                message = messages.recv() => {
                    return match message {
                        Some(message) => Ok(message.to_string()),
                        None => Err(self.peer_closed()),
                    };
                }
                changed = severed.changed() => {
                    if changed.is_err() {
                        return Err(self.peer_closed());
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.abort_replies();
        }
        self.link.send_replace(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn observers_mut(&mut self) -> &mut TransportObservers {
        &mut self.observers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportObserver;

    struct CloseFlag(Arc<AtomicBool>);

    impl TransportObserver for CloseFlag {
        fn on_close(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_sever_fails_next_send() {
        let server = InMemoryServer::new("mem");
        let mut transport = server.factory().create().await.unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        transport.observers_mut().push(Arc::new(CloseFlag(Arc::clone(&closed))));

        server.sever();
        let result = transport.send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;

        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_refusing_server_fails_create() {
        let server = InMemoryServer::new("mem");
        server.set_refusing(true);
        assert!(server.factory().create().await.is_err());
        assert_eq!(server.connection_count(), 0);

        server.set_refusing(false);
        assert!(server.factory().create().await.is_ok());
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_sever_wakes_parked_receive() {
        let server = InMemoryServer::new("mem");
        let mut transport = server.factory().create().await.unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        transport.observers_mut().push(Arc::new(CloseFlag(Arc::clone(&closed))));
        let transport: Arc<dyn Transport> = Arc::from(transport);

        let reader = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move { transport.receive().await }
        });
        tokio::task::yield_now().await;
        server.sever();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reply_does_not_hold_back_later_requests() {
        let server = InMemoryServer::new("mem");
        server.add_tool(
            McpToolDefinition::new("hang", "Slow"),
            ToolBehavior::delayed(Duration::from_secs(30), ToolBehavior::echo()),
        );
        let transport = server.factory().create().await.unwrap();

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"hang"}}"#)
            .await
            .unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        let first: Value = serde_json::from_str(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(first["id"], 2);
        assert!(start.elapsed() < Duration::from_secs(1));

        let second: Value = serde_json::from_str(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(second["id"], 1);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_unknown_method_is_rejected() {
        let server = InMemoryServer::new("mem");
        let transport = server.factory().create().await.unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":9,"method":"resources/list"}"#)
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&transport.receive().await.unwrap()).unwrap();
        assert_eq!(reply["error"]["code"], JsonRpcError::METHOD_NOT_FOUND);
    }
}
