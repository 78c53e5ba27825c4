//! In-memory port adapters.
//!
//! Back the ports with configuration instead of a database. Used by the
//! binary and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use toolhub_core::{ServerConfig, TokenGrant};

use crate::ports::{PortResult, ServerRecord, ServerRegistry, TokenValidation, TokenValidator};

#[derive(Debug, Clone)]
enum Scope {
    All,
    Servers(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Grant {
    client_id: String,
    scope: Scope,
}

/// Token validator over a fixed set of grants.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    grants: Arc<RwLock<HashMap<String, Grant>>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured grants; grants whose token cannot be resolved
    /// are skipped.
    pub fn from_grants(grants: &[TokenGrant]) -> Self {
        let validator = Self::new();
        for grant in grants {
            let Some(token) = grant.resolve_token() else {
                tracing::warn!(client_id = %grant.client_id, "Skipping token grant without a token");
                continue;
            };
            if grant.grants_all() {
                validator.grant_all(token, &grant.client_id);
            } else {
                validator.grant(token, &grant.client_id, grant.servers.iter().cloned());
            }
        }
        validator
    }

    /// Allow `token` on the given server ids.
    pub fn grant(
        &self,
        token: impl Into<String>,
        client_id: impl Into<String>,
        servers: impl IntoIterator<Item = String>,
    ) {
        self.grants.write().insert(
            token.into(),
            Grant {
                client_id: client_id.into(),
                scope: Scope::Servers(servers.into_iter().collect()),
            },
        );
    }

    /// Allow `token` on every server.
    pub fn grant_all(&self, token: impl Into<String>, client_id: impl Into<String>) {
        self.grants.write().insert(
            token.into(),
            Grant {
                client_id: client_id.into(),
                scope: Scope::All,
            },
        );
    }

    pub fn revoke(&self, token: &str) {
        self.grants.write().remove(token);
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> PortResult<TokenValidation> {
        Ok(match self.grants.read().get(token) {
            Some(grant) => TokenValidation::valid(&grant.client_id),
            None => TokenValidation::invalid(),
        })
    }

    async fn has_access(&self, token: &str, server_id: &str) -> PortResult<bool> {
        Ok(match self.grants.read().get(token) {
            Some(Grant {
                scope: Scope::All, ..
            }) => true,
            Some(Grant {
                scope: Scope::Servers(servers),
                ..
            }) => servers.contains(server_id),
            None => false,
        })
    }
}

/// Server registry kept in memory, preserving registration order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServerRegistry {
    servers: Arc<RwLock<Vec<ServerRecord>>>,
}

impl InMemoryServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ServerConfig]) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.register(ServerRecord::from(config));
        }
        registry
    }

    /// Add a record, or replace the one with the same id in place.
    pub fn register(&self, record: ServerRecord) {
        let mut servers = self.servers.write();
        match servers.iter_mut().find(|s| s.id == record.id) {
            Some(existing) => *existing = record,
            None => servers.push(record),
        }
    }

    pub fn remove(&self, server_id: &str) -> Option<ServerRecord> {
        let mut servers = self.servers.write();
        let position = servers.iter().position(|s| s.id == server_id)?;
        Some(servers.remove(position))
    }
}

#[async_trait]
impl ServerRegistry for InMemoryServerRegistry {
    async fn list_servers(&self) -> PortResult<Vec<ServerRecord>> {
        Ok(self.servers.read().clone())
    }

    async fn get(&self, server_id: &str) -> PortResult<Option<ServerRecord>> {
        Ok(self.servers.read().iter().find(|s| s.id == server_id).cloned())
    }
}
