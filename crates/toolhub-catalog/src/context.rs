//! Everything the catalog handler reads, gathered in one injected value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use toolhub_core::CatalogConfig;
use toolhub_mcp::{RunningStatus, SessionRegistry};

use crate::ports::{ServerRegistry, TokenValidator};

/// Collaborators of the catalog handler.
#[derive(Clone)]
pub struct CatalogContext {
    pub tokens: Arc<dyn TokenValidator>,
    pub servers: Arc<dyn ServerRegistry>,
    /// Live sessions by server id
    pub sessions: SessionRegistry,
    /// Running flag by server name
    pub running: RunningStatus,
}

impl CatalogContext {
    pub fn new(
        tokens: Arc<dyn TokenValidator>,
        servers: Arc<dyn ServerRegistry>,
        sessions: SessionRegistry,
        running: RunningStatus,
    ) -> Self {
        Self {
            tokens,
            servers,
            sessions,
            running,
        }
    }
}

impl fmt::Debug for CatalogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogContext")
            .field("sessions", &self.sessions.len())
            .field("running", &self.running.snapshot())
            .finish_non_exhaustive()
    }
}

/// Tunables for the handler.
#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub default_max_results: usize,
    pub max_results_limit: usize,
    /// Timeout for a tool call, restarted by every progress notification
    pub call_timeout: Duration,
    pub description_preview_chars: usize,
    /// Suggestions offered when a tool is not found
    pub max_suggestions: usize,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self::from(&CatalogConfig::default())
    }
}

impl From<&CatalogConfig> for CatalogOptions {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            default_max_results: config.default_max_results,
            max_results_limit: config.max_results_limit.max(1),
            call_timeout: config.call_timeout(),
            description_preview_chars: config.description_preview_chars,
            max_suggestions: 3,
        }
    }
}

impl CatalogOptions {
    /// The result count to use for a request asking for `requested`.
    pub fn result_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_max_results)
            .clamp(1, self.max_results_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_limit_is_clamped() {
        let options = CatalogOptions::default();
        assert_eq!(options.result_limit(None), 10);
        assert_eq!(options.result_limit(Some(3)), 3);
        assert_eq!(options.result_limit(Some(500)), 50);
    }
}
