//! Wires configuration, sessions and the catalog together.

use std::sync::Arc;

use toolhub_catalog::{
    CatalogContext, InMemoryServerRegistry, StaticTokenValidator, ToolCatalogHandler,
};
use toolhub_core::Config;
use toolhub_mcp::SessionManager;
use tracing::warn;

/// A running hub: live backend sessions behind one catalog handler.
pub struct Hub {
    pub manager: SessionManager,
    pub handler: ToolCatalogHandler,
}

impl Hub {
    /// Connect every enabled server and build the catalog over them.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let manager = SessionManager::new(config);
        let report = manager.start_all(&config.servers).await;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some servers are unavailable");
        }

        let context = CatalogContext::new(
            Arc::new(StaticTokenValidator::from_grants(&config.tokens)),
            Arc::new(InMemoryServerRegistry::from_configs(&config.servers)),
            manager.sessions(),
            manager.running_status(),
        );
        let handler = ToolCatalogHandler::from_config(context, &config.catalog)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        Ok(Self { manager, handler })
    }

    /// Stop every session.
    pub async fn shutdown(self) {
        self.manager.stop_all().await;
    }
}
