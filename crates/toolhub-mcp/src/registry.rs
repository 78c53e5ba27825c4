//! Shared live-session and running-status maps.
//!
//! Both are written by the lifecycle manager and read by the catalog. Handles
//! are cheap clones over the same map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::session::SessionClient;

/// Live sessions by server id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionClient>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its server id, returning any replaced one.
    pub fn insert(&self, session: SessionClient) -> Option<SessionClient> {
        self.sessions
            .write()
            .insert(session.server_id().to_string(), session)
    }

    pub fn get(&self, server_id: &str) -> Option<SessionClient> {
        self.sessions.read().get(server_id).cloned()
    }

    pub fn remove(&self, server_id: &str) -> Option<SessionClient> {
        self.sessions.write().remove(server_id)
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<SessionClient> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    /// Server ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> Vec<SessionClient> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Whether each server, by name, is reported running.
#[derive(Debug, Clone, Default)]
pub struct RunningStatus {
    running: Arc<RwLock<HashMap<String, bool>>>,
}

impl RunningStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server_name: impl Into<String>, running: bool) {
        self.running.write().insert(server_name.into(), running);
    }

    /// Unknown servers are not running.
    pub fn is_running(&self, server_name: &str) -> bool {
        self.running
            .read()
            .get(server_name)
            .copied()
            .unwrap_or(false)
    }

    pub fn remove(&self, server_name: &str) {
        self.running.write().remove(server_name);
    }

    pub fn snapshot(&self) -> HashMap<String, bool> {
        self.running.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryServer;
    use crate::session::SessionConfig;

    #[test]
    fn test_session_registry_replaces_by_id() {
        let server = InMemoryServer::new("mem");
        let registry = SessionRegistry::new();
        let first = SessionClient::new(SessionConfig::new("b", "beta"), Arc::new(server.factory()));
        let second = SessionClient::new(SessionConfig::new("b", "beta-2"), Arc::new(server.factory()));
        let other = SessionClient::new(SessionConfig::new("a", "alpha"), Arc::new(server.factory()));

        assert!(registry.insert(first).is_none());
        assert!(registry.insert(other).is_none());
        assert_eq!(registry.insert(second).unwrap().server_name(), "beta");

        assert_eq!(registry.ids(), vec!["a", "b"]);
        assert_eq!(registry.get("b").unwrap().server_name(), "beta-2");
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_running_status_defaults_to_stopped() {
        let status = RunningStatus::new();
        assert!(!status.is_running("github"));

        let shared = status.clone();
        shared.set("github", true);
        assert!(status.is_running("github"));

        status.remove("github");
        assert!(!shared.is_running("github"));
    }
}
