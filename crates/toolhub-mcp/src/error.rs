//! Session and transport failures.

use thiserror::Error;

/// A failure moving bytes to or from a backend server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not start server process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("failed writing to server: {0}")]
    WriteError(std::io::Error),

    #[error("failed reading from server: {0}")]
    ReadError(std::io::Error),

    #[error("http transport: {0}")]
    Http(String),

    /// The peer went away mid-conversation.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport is not open")]
    NotConnected,
}

// io::Error is not Clone; a copy keeps the kind and message.
impl Clone for TransportError {
    fn clone(&self) -> Self {
        let copy = |e: &std::io::Error| std::io::Error::new(e.kind(), e.to_string());
        match self {
            Self::SpawnFailed(e) => Self::SpawnFailed(copy(e)),
            Self::WriteError(e) => Self::WriteError(copy(e)),
            Self::ReadError(e) => Self::ReadError(copy(e)),
            Self::Http(message) => Self::Http(message.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::NotConnected => Self::NotConnected,
        }
    }
}

/// A failure of an MCP session operation.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The peer sent something that is not valid MCP.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("handshake failed: {0}")]
    InitializationFailed(String),

    /// A JSON-RPC error reply.
    #[error("server error (code {code}): {message}")]
    ServerError { code: i32, message: String },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session {0} is not connected")]
    NotConnected(String),

    /// Disposal is terminal.
    #[error("session {0} has been disposed")]
    Disposed(String),

    /// A reconnect sequence owns the session until it succeeds or fails.
    #[error("session {0} is already reconnecting")]
    Reconnecting(String),

    #[error("request timed out after {0} seconds")]
    Timeout(u64),
}

impl McpError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn init_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    /// Build from the parts of a JSON-RPC error object.
    pub fn server_error(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }

    /// Whether the failure came from the transport rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<McpError> for toolhub_core::Error {
    fn from(e: McpError) -> Self {
        toolhub_core::Error::Mcp(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcp_error_display() {
        let err = McpError::Disposed("srv-1".to_string());
        assert_eq!(err.to_string(), "session srv-1 has been disposed");

        let err = McpError::server_error(-32600, "Invalid request");
        assert_eq!(err.to_string(), "server error (code -32600): Invalid request");
    }

    #[test]
    fn test_transport_classification() {
        assert!(McpError::from(TransportError::ConnectionClosed).is_transport());
        assert!(!McpError::Timeout(5).is_transport());
    }

    #[test]
    fn test_mcp_error_to_core_error() {
        let err = McpError::protocol("test error");
        let core_err: toolhub_core::Error = err.into();
        assert!(matches!(core_err, toolhub_core::Error::Mcp(_)));
    }
}
