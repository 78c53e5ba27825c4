//! MCP transport implementations.
//!
//! Two transports are provided: stdio, which spawns a child process and
//! exchanges newline-delimited JSON over stdin/stdout, and streamable HTTP,
//! which POSTs each message and streams JSON or SSE replies back.
//!
//! Every transport carries an ordered [`TransportObservers`] list. Whoever
//! builds a transport may register observers, and the owning session adds its
//! own afterwards; all of them are notified, in registration order, when the
//! transport detects that the peer closed or failed.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::sse::{SseEvent, SseParser};

/// Header carrying the server-assigned HTTP session.
const SESSION_HEADER: &str = "mcp-session-id";

/// Observer of unexpected transport termination.
pub trait TransportObserver: Send + Sync {
    /// The peer closed the connection.
    fn on_close(&self) {}

    /// The transport hit an I/O or protocol failure.
    fn on_error(&self, _error: &TransportError) {}
}

/// Ordered list of transport observers.
#[derive(Clone, Default)]
pub struct TransportObservers {
    observers: Vec<Arc<dyn TransportObserver>>,
}

impl TransportObservers {
    /// Register an observer after all existing ones.
    pub fn push(&mut self, observer: Arc<dyn TransportObserver>) {
        self.observers.push(observer);
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn notify_close(&self) {
        for observer in &self.observers {
            observer.on_close();
        }
    }

    pub fn notify_error(&self, error: &TransportError) {
        for observer in &self.observers {
            observer.on_error(error);
        }
    }
}

impl fmt::Debug for TransportObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportObservers")
            .field("len", &self.observers.len())
            .finish()
    }
}

/// Trait for MCP transport implementations.
///
/// A connection drives a transport from two sides at once: callers `send`
/// concurrently while one reader task loops on `receive`. Implementations
/// lock internally, and `receive` must be cancellation safe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the server.
    async fn send(&self, message: &str) -> Result<(), TransportError>;

    /// Wait for the next message from the server.
    async fn receive(&self) -> Result<String, TransportError>;

    /// Close the transport connection.
    ///
    /// An intentional close does not notify observers.
    async fn close(&self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Observers notified on unexpected close or error.
    fn observers_mut(&mut self) -> &mut TransportObservers;
}

/// Builds a fresh transport for every (re)connect.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a brand-new, unshared transport.
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// Stdio
// ============================================================================

/// Stdout plus the bytes of a line not yet terminated.
struct LineReader {
    reader: BufReader<ChildStdout>,
    line: Vec<u8>,
}

/// Standard I/O transport for MCP servers.
pub struct StdioTransport {
    /// The child process.
    child: Mutex<Child>,
    pid: Option<u32>,
    /// Stdin writer for sending messages.
    stdin: Mutex<ChildStdin>,
    /// Buffered stdout reader for receiving messages.
    stdout: Mutex<LineReader>,
    /// Whether the transport is connected.
    connected: AtomicBool,
    observers: TransportObservers,
}

impl StdioTransport {
    /// Spawn a new stdio transport.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to execute (e.g., "npx" or "/path/to/server")
    /// * `args` - Command arguments
    /// * `env` - Environment variables to set for the child process
    /// * `working_dir` - Optional working directory for the child process
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&PathBuf>,
    ) -> Result<Self, TransportError> {
        debug!(command = command, args = ?args, "Spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin"))
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout"))
        })?;

        Ok(Self {
            pid: child.id(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(LineReader {
                reader: BufReader::new(stdout),
                line: Vec::new(),
            }),
            connected: AtomicBool::new(true),
            observers: TransportObservers::default(),
        })
    }

    /// Get the process ID of the child process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Observers hear about a failure only while the transport is open.
    fn fail(&self, error: TransportError) -> TransportError {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.observers.notify_error(&error);
        }
        error
    }

    fn peer_closed(&self) -> TransportError {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.observers.notify_close();
        }
        TransportError::ConnectionClosed
    }

    async fn write_line(&self, message: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        debug!(message = message, "Sending message to MCP server");

        if let Err(e) = self.write_line(message).await {
            return Err(self.fail(TransportError::WriteError(e)));
        }

        Ok(())
    }

    async fn receive(&self) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut stdout = self.stdout.lock().await;
        let LineReader { reader, line } = &mut *stdout;
        loop {
            // A dropped read leaves its bytes in `line` for the next call
            let bytes_read = match reader.read_until(b'\n', line).await {
                Ok(n) => n,
                Err(e) => return Err(self.fail(TransportError::ReadError(e))),
            };

            if bytes_read == 0 {
                line.clear();
                return Err(self.peer_closed());
            }
            if line.last() != Some(&b'\n') {
                continue;
            }

            let message = String::from_utf8_lossy(line).trim().to_string();
            line.clear();

            // Servers sometimes emit blank keep-alive lines
            if !message.is_empty() {
                debug!(message = %message, "Received message from MCP server");
                return Ok(message);
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Closing MCP server transport");

        let mut child = self.child.lock().await;
        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                debug!(pid = pid, "Sending SIGTERM to MCP server");
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        debug!("MCP server exited gracefully");
                    }
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {
                        warn!(pid = pid, "MCP server did not exit gracefully, killing");
                        let _ = child.kill().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                debug!(pid = pid, "Killing MCP server");
                let _ = child.kill().await;
            }
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn observers_mut(&mut self) -> &mut TransportObservers {
        &mut self.observers
    }
}

/// Spawns a new child process per connect.
#[derive(Debug, Clone)]
pub struct StdioTransportFactory {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl StdioTransportFactory {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl TransportFactory for StdioTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport =
            StdioTransport::spawn(&self.command, &self.args, &self.env, self.working_dir.as_ref())
                .await?;
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!("stdio:{}", self.command)
    }
}

// ============================================================================
// Streamable HTTP
// ============================================================================

type Inbound = Result<String, TransportError>;

/// Streamable HTTP transport.
///
/// Each `send` is one POST. Once the server accepts it, a background task
/// reads the reply body and forwards each JSON-RPC message to `receive` as
/// soon as it arrives, so progress events on a long SSE stream are seen
/// while the stream is still open.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    credential: Option<String>,
    session_id: parking_lot::Mutex<Option<String>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    /// Reply bodies still being read.
    streams: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    observers: TransportObservers,
}

impl HttpTransport {
    /// Create a transport for the given endpoint.
    ///
    /// Only connection setup is bounded here; how long a reply may take is
    /// up to the caller.
    pub fn new(
        url: impl Into<String>,
        credential: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            client,
            url: url.into(),
            credential,
            session_id: parking_lot::Mutex::new(None),
            inbound_tx,
            inbound: Mutex::new(inbound_rx),
            streams: parking_lot::Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            observers: TransportObservers::default(),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn fail(&self, error: TransportError) -> TransportError {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.observers.notify_error(&error);
        }
        error
    }

    fn peer_closed(&self) -> TransportError {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.observers.notify_close();
        }
        TransportError::ConnectionClosed
    }

    fn track(&self, reader: JoinHandle<()>) {
        let mut streams = self.streams.lock();
        streams.retain(|stream| !stream.is_finished());
        streams.push(reader);
    }
}

/// Forward every message event of an SSE body as it is parsed.
async fn stream_events(
    response: reqwest::Response,
    sink: &mpsc::UnboundedSender<Inbound>,
) -> Result<(), TransportError> {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| TransportError::Http(e.to_string()))?;
        for event in parser.feed(&chunk) {
            deliver_event(sink, &event);
        }
    }
    if let Some(event) = parser.finish() {
        deliver_event(sink, &event);
    }
    Ok(())
}

async fn read_json(
    response: reqwest::Response,
    sink: &mpsc::UnboundedSender<Inbound>,
) -> Result<(), TransportError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?;
    deliver_json(sink, &String::from_utf8_lossy(&body));
    Ok(())
}

fn deliver_event(sink: &mpsc::UnboundedSender<Inbound>, event: &SseEvent) {
    if event.is_message() {
        deliver_json(sink, &event.data);
    }
}

fn deliver_json(sink: &mpsc::UnboundedSender<Inbound>, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    // Servers may batch several messages into one array
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(items)) => {
            for item in items {
                let _ = sink.send(Ok(item.to_string()));
            }
        }
        _ => {
            let _ = sink.send(Ok(body.to_string()));
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(message.to_string());

        if let Some(ref credential) = self.credential {
            request = request.header(AUTHORIZATION, format!("Bearer {}", credential));
        }
        let session_id = self.session_id();
        if let Some(ref session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(TransportError::Http(e.to_string()))),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && session_id.is_some() {
            // The server forgot our session; only a fresh handshake helps
            return Err(self.peer_closed());
        }
        if !status.is_success() {
            return Err(self.fail(TransportError::Http(format!("unexpected status {}", status))));
        }

        if let Some(assigned) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(assigned.to_string());
        }

        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let sink = self.inbound_tx.clone();
        self.track(tokio::spawn(async move {
            let outcome = if is_sse {
                stream_events(response, &sink).await
            } else {
                read_json(response, &sink).await
            };
            if let Err(e) = outcome {
                let _ = sink.send(Err(e));
            }
        }));

        Ok(())
    }

    async fn receive(&self) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(self.fail(e)),
            None => Err(self.peer_closed()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        for stream in self.streams.lock().drain(..) {
            stream.abort();
        }
        // Wake a reader parked in `receive`
        let _ = self.inbound_tx.send(Err(TransportError::NotConnected));

        let session_id = self.session_id.lock().take();
        if let Some(session_id) = session_id {
            debug!(url = %self.url, "Terminating HTTP session");
            let _ = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, session_id)
                .send()
                .await;
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn observers_mut(&mut self) -> &mut TransportObservers {
        &mut self.observers
    }
}

/// Opens a new HTTP session per connect.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    pub url: String,
    pub credential: Option<String>,
    /// Bound on establishing the TCP/TLS connection of each POST.
    pub connect_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(url: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            url: url.into(),
            credential,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl TransportFactory for HttpTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = HttpTransport::new(&self.url, self.credential.clone(), self.connect_timeout)?;
        Ok(Box::new(transport))
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}
