//! Collaborator ports consumed by the catalog.
//!
//! Token validation and the server registry are owned elsewhere (usually a
//! database); the catalog only reads through these traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use toolhub_core::ServerConfig;

use crate::error::CatalogError;

/// Result type for port operations.
pub type PortResult<T> = Result<T, PortError>;

/// Failure inside a collaborator.
#[derive(Debug, Clone, Error)]
pub enum PortError {
    #[error("collaborator error: {0}")]
    Backend(Arc<dyn std::error::Error + Send + Sync>),
}

impl PortError {
    /// Wraps a collaborator failure.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Arc::new(err))
    }
}

impl From<PortError> for CatalogError {
    fn from(e: PortError) -> Self {
        CatalogError::Internal(e.to_string())
    }
}

/// Result of validating a caller token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub is_valid: bool,
    pub client_id: Option<String>,
}

impl TokenValidation {
    pub fn valid(client_id: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            client_id: Some(client_id.into()),
        }
    }

    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            client_id: None,
        }
    }
}

/// Validates caller tokens and their per-server grants.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> PortResult<TokenValidation>;

    async fn has_access(&self, token: &str, server_id: &str) -> PortResult<bool>;
}

/// A registered backend server as the catalog sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub project_id: Option<String>,
    /// Explicit per-tool enable flags; tools not listed are enabled.
    pub tool_permissions: HashMap<String, bool>,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project_id: None,
            tool_permissions: HashMap::new(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_tool_enabled(mut self, tool: impl Into<String>, enabled: bool) -> Self {
        self.tool_permissions.insert(tool.into(), enabled);
        self
    }

    pub fn is_tool_enabled(&self, tool: &str) -> bool {
        self.tool_permissions.get(tool).copied().unwrap_or(true)
    }
}

impl From<&ServerConfig> for ServerRecord {
    fn from(config: &ServerConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            project_id: config.project.clone(),
            tool_permissions: config
                .disabled_tools
                .iter()
                .map(|tool| (tool.clone(), false))
                .collect(),
        }
    }
}

/// Read access to registered servers.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Every server, in registration order.
    async fn list_servers(&self) -> PortResult<Vec<ServerRecord>>;

    async fn get(&self, server_id: &str) -> PortResult<Option<ServerRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_are_enabled_unless_listed() {
        let record = ServerRecord::new("1", "github").with_tool_enabled("delete_repo", false);
        assert!(record.is_tool_enabled("create_issue"));
        assert!(!record.is_tool_enabled("delete_repo"));
    }

    #[test]
    fn test_record_from_config() {
        let mut config = ServerConfig::stdio("srv-1", "github", "gh-mcp").with_project("web");
        config.disabled_tools = vec!["delete_repo".to_string()];

        let record = ServerRecord::from(&config);
        assert_eq!(record.project_id.as_deref(), Some("web"));
        assert!(!record.is_tool_enabled("delete_repo"));
    }
}
