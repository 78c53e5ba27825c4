//! # toolhub-mcp
//!
//! Long-lived, self-healing MCP (Model Context Protocol) sessions.
//!
//! This crate provides:
//! - MCP protocol types and a request/response client
//! - stdio, streamable HTTP and in-memory transports
//! - Health checking with edge-triggered callbacks
//! - A connection state machine with exponential-backoff reconnects
//! - `SessionClient`, which ties the above together per backend server
//! - Shared session/status registries and a config-driven `SessionManager`

pub mod client;
pub mod discovery;
pub mod error;
pub mod health;
pub mod memory;
pub mod monitor;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod sse;
pub mod transport;

pub use client::McpConnection;
pub use discovery::{factory_for, SessionManager, ServerStatus, StartReport};
pub use error::{McpError, TransportError};
pub use health::{HealthChecker, LivenessCheck, HttpLivenessCheck};
pub use memory::{InMemoryServer, ToolBehavior};
pub use monitor::{ConnectionMonitor, ConnectionState, ReconnectConfig, ReconnectPlan, Reconnector};
pub use protocol::{CallToolResult, McpToolDefinition, ToolContent};
pub use registry::{RunningStatus, SessionRegistry};
pub use session::{HealthTarget, SessionClient, SessionConfig};
pub use transport::{Transport, TransportFactory, TransportObserver, TransportObservers};
