//! Operation responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use toolhub_mcp::protocol::{CallToolResult, ToolContent};

use crate::error::CatalogError;

/// What every catalog operation returns to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResponse {
    /// A successful response carrying `value` as structured content and as
    /// pretty-printed text.
    pub fn json(value: Value) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        Self {
            content: vec![ToolContent::text(text)],
            structured_content: Some(value),
            is_error: false,
        }
    }

    /// An error response with the payload as structured content and text.
    pub fn error(error: &CatalogError) -> Self {
        let payload = error.payload();
        let text = payload.to_text();
        Self {
            content: vec![ToolContent::text(text)],
            structured_content: serde_json::to_value(&payload).ok(),
            is_error: true,
        }
    }

    /// Relay a backend tool result.
    pub fn from_call_result(result: CallToolResult) -> Self {
        Self {
            content: result.content,
            structured_content: result.structured_content,
            is_error: result.is_error,
        }
    }

    /// The error code, if this is an error response.
    pub fn error_type(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.structured_content
            .as_ref()
            .and_then(|v| v.get("errorType"))
            .and_then(Value::as_str)
    }
}

/// Prefix every resource URI in `result` with `server_name`, so callers
/// address resources through the aggregator rather than the backend.
pub fn rewrite_resource_links(result: &mut CallToolResult, server_name: &str) {
    for item in &mut result.content {
        match item {
            ToolContent::ResourceLink { uri, .. } => *uri = namespaced_uri(server_name, uri),
            ToolContent::Resource { resource } => {
                resource.uri = namespaced_uri(server_name, &resource.uri)
            }
            _ => {}
        }
    }
}

fn namespaced_uri(server_name: &str, uri: &str) -> String {
    format!("{}:{}", server_name, uri)
}
