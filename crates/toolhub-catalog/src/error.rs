//! Caller-facing errors.
//!
//! Every rejection the catalog produces is a [`CatalogError`]. Callers are
//! often language-model agents, so each error renders to an
//! [`ErrorPayload`] with a stable code, a corrective action and ordered
//! remediation steps, both as structured data and as plain text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use toolhub_mcp::ConnectionState;

/// Errors surfaced by catalog operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("the caller token is missing or invalid")]
    InvalidToken,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool key '{key}' is malformed")]
    MalformedToolKey { key: String },

    #[error("tool key '{key}' has expired")]
    ToolKeyExpired { key: String },

    #[error("tool key '{key}' does not refer to a known tool")]
    ToolKeyNotFound { key: String },

    #[error("server '{server_id}' does not exist")]
    ServerNotFound { server_id: String },

    #[error("access to server '{server_name}' is not granted to this token")]
    AccessDenied { server_id: String, server_name: String },

    #[error("server '{server_name}' is not part of the current project")]
    ProjectMismatch {
        server_name: String,
        server_project: Option<String>,
        caller_project: Option<String>,
    },

    #[error("tool '{tool}' is disabled on server '{server_name}'")]
    ToolDisabled { server_name: String, tool: String },

    #[error("server '{server_name}' has no live connection")]
    ServerNotConnected {
        server_name: String,
        state: Option<ConnectionState>,
    },

    #[error("server '{server_name}' is not running")]
    ServerNotRunning { server_name: String },

    #[error("tool '{tool}' does not exist on server '{server_name}'")]
    ToolNotFound {
        server_name: String,
        tool: String,
        suggestions: Vec<String>,
    },

    #[error("tool '{tool}' on server '{server_name}' timed out after {seconds}s without progress")]
    ToolTimeout {
        server_name: String,
        tool: String,
        seconds: u64,
    },

    #[error("tool '{tool}' on server '{server_name}' failed: {message}")]
    ToolExecutionFailed {
        server_name: String,
        tool: String,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Structured rendering of a [`CatalogError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_type: String,
    pub message: String,
    pub recovery_action: String,
    pub recovery_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_tools: Vec<String>,
    pub retriable: bool,
}

impl ErrorPayload {
    /// Plain-text form for callers that only read message text.
    pub fn to_text(&self) -> String {
        let mut text = format!("Error [{}]: {}\nAction: {}", self.error_type, self.message, self.recovery_action);
        if !self.recovery_steps.is_empty() {
            text.push_str("\nSteps:");
            for (i, step) in self.recovery_steps.iter().enumerate() {
                text.push_str(&format!("\n  {}. {}", i + 1, step));
            }
        }
        if let Some(ref hint) = self.hint {
            text.push_str(&format!("\nHint: {}", hint));
        }
        if !self.suggested_tools.is_empty() {
            text.push_str(&format!("\nSuggested: {}", self.suggested_tools.join(", ")));
        }
        if self.retriable {
            text.push_str("\nThis may be temporary; retrying later can succeed.");
        }
        text
    }
}

impl CatalogError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidToken => "INVALID_TOKEN",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::MalformedToolKey { .. } => "MALFORMED_TOOL_KEY",
            Self::ToolKeyExpired { .. } => "TOOL_KEY_EXPIRED",
            Self::ToolKeyNotFound { .. } => "TOOL_KEY_NOT_FOUND",
            Self::ServerNotFound { .. } => "SERVER_NOT_FOUND",
            Self::AccessDenied { .. } => "ACCESS_DENIED",
            Self::ProjectMismatch { .. } => "PROJECT_MISMATCH",
            Self::ToolDisabled { .. } => "TOOL_DISABLED",
            Self::ServerNotConnected { .. } => "SERVER_NOT_CONNECTED",
            Self::ServerNotRunning { .. } => "SERVER_NOT_RUNNING",
            Self::ToolNotFound { .. } => "TOOL_NOT_FOUND",
            Self::ToolTimeout { .. } => "TOOL_TIMEOUT",
            Self::ToolExecutionFailed { .. } => "TOOL_EXECUTION_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the same call may succeed later without caller changes.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ServerNotConnected { .. } | Self::ServerNotRunning { .. } | Self::ToolTimeout { .. }
        )
    }

    pub fn payload(&self) -> ErrorPayload {
        let (action, steps, hint, suggested) = self.guidance();
        ErrorPayload {
            error_type: self.code().to_string(),
            message: self.to_string(),
            recovery_action: action.to_string(),
            recovery_steps: steps.into_iter().map(String::from).collect(),
            hint,
            suggested_tools: suggested,
            retriable: self.is_retriable(),
        }
    }

    fn guidance(&self) -> (&'static str, Vec<&'static str>, Option<String>, Vec<String>) {
        match self {
            Self::InvalidToken => (
                "Provide a valid access token",
                vec![
                    "Check that the token is passed with the request",
                    "Ask the administrator for a new token if it was revoked",
                ],
                None,
                Vec::new(),
            ),
            Self::InvalidRequest(_) => (
                "Fix the request parameters",
                vec!["Check the operation name and required fields", "Send the request again"],
                None,
                Vec::new(),
            ),
            Self::MalformedToolKey { .. } => (
                "Use a tool key returned by discover",
                vec![
                    "Call discover with keywords describing the task",
                    "Copy the toolKey of the chosen result exactly",
                ],
                Some("Tool keys look like 'server:tool'".to_string()),
                vec!["discover".to_string()],
            ),
            Self::ToolKeyExpired { .. } => (
                "Get a fresh tool key",
                vec!["Call discover again", "Execute with the new toolKey"],
                Some("Tool keys from discover are only valid for a limited time".to_string()),
                vec!["discover".to_string()],
            ),
            Self::ToolKeyNotFound { .. } => (
                "Get a current tool key",
                vec!["Call discover to list available tools", "Execute with a returned toolKey"],
                None,
                vec!["discover".to_string()],
            ),
            Self::ServerNotFound { .. } => (
                "Pick a tool from an existing server",
                vec![
                    "Call capabilities to see the available servers",
                    "Call discover to find an equivalent tool",
                ],
                None,
                vec!["capabilities".to_string(), "discover".to_string()],
            ),
            Self::AccessDenied { server_name, .. } => (
                "Request access or use another server",
                vec![
                    "Ask the administrator to grant this token access",
                    "Call discover to find tools on servers you can use",
                ],
                Some(format!("Grant access to '{}' for this token", server_name)),
                vec!["discover".to_string()],
            ),
            Self::ProjectMismatch {
                server_project,
                caller_project,
                ..
            } => (
                "Switch project or pick a server in the current project",
                vec![
                    "Call discover within the current project",
                    "Or repeat the call from the server's project",
                ],
                Some(format!(
                    "Server project: {}, current project: {}",
                    server_project.as_deref().unwrap_or("none"),
                    caller_project.as_deref().unwrap_or("none")
                )),
                vec!["discover".to_string()],
            ),
            Self::ToolDisabled { .. } => (
                "Use a different tool",
                vec![
                    "Call discover to find an enabled alternative",
                    "Ask the administrator to enable the tool",
                ],
                None,
                vec!["discover".to_string()],
            ),
            Self::ServerNotConnected { state, .. } => (
                "Wait for the server to reconnect and retry",
                vec![
                    "Wait a few seconds",
                    "Retry the same call",
                    "Call capabilities to check the server status",
                ],
                state.map(|s| format!("Connection state: {}", s)),
                vec!["capabilities".to_string()],
            ),
            Self::ServerNotRunning { .. } => (
                "Start the server and retry",
                vec![
                    "Ask the administrator to start the server",
                    "Retry the call once it is running",
                ],
                None,
                vec!["capabilities".to_string()],
            ),
            Self::ToolNotFound { suggestions, .. } => (
                "Use one of the suggested tools",
                vec![
                    "Pick a suggested toolKey, or call discover",
                    "Execute with the chosen toolKey",
                ],
                None,
                if suggestions.is_empty() {
                    vec!["discover".to_string()]
                } else {
                    suggestions.clone()
                },
            ),
            Self::ToolTimeout { .. } => (
                "Retry with a smaller request",
                vec![
                    "Reduce the scope of the arguments",
                    "Retry the call",
                ],
                Some("The tool stopped reporting progress".to_string()),
                Vec::new(),
            ),
            Self::ToolExecutionFailed { .. } => (
                "Check the arguments and retry",
                vec![
                    "Compare the arguments with the tool's input schema",
                    "Call discover with detailLevel 'full' to read the schema",
                    "Retry the call",
                ],
                None,
                vec!["discover".to_string()],
            ),
            Self::Internal(_) => (
                "Retry, then report the problem",
                vec!["Retry the call", "Report the error if it persists"],
                None,
                Vec::new(),
            ),
        }
    }
}

impl From<CatalogError> for toolhub_core::Error {
    fn from(e: CatalogError) -> Self {
        toolhub_core::Error::Catalog(e.to_string())
    }
}
