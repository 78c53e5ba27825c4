//! Configuration system for Toolhub.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

/// Grant value that gives a token access to every server.
pub const ALL_SERVERS: &str = "*";

/// Main configuration struct for Toolhub.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog (discover/execute/capabilities) settings
    pub catalog: CatalogConfig,
    /// Reconnect tuning shared by every session
    pub reconnect: ReconnectSettings,
    /// Health check tuning shared by every session
    pub health: HealthSettings,
    /// Backend tool servers
    pub servers: Vec<ServerConfig>,
    /// Caller tokens and their server grants
    pub tokens: Vec<TokenGrant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// toolKey encoding: semantic, ephemeral, migrating
    pub tool_key_scheme: String,
    /// Encoding the migrating scheme mints: semantic or ephemeral
    pub migrating_primary: String,
    /// Lifetime of ephemeral tool keys
    pub ephemeral_ttl_secs: u64,
    /// Results returned by discover when the caller does not ask
    pub default_max_results: usize,
    /// Upper bound on requested results
    pub max_results_limit: usize,
    /// Tool call timeout, reset by progress notifications
    pub call_timeout_secs: u64,
    /// Description length in summary results
    pub description_preview_chars: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            tool_key_scheme: "semantic".to_string(),
            migrating_primary: "semantic".to_string(),
            ephemeral_ttl_secs: 3600,
            default_max_results: 10,
            max_results_limit: 50,
            call_timeout_secs: 300,
            description_preview_chars: 160,
        }
    }
}

impl CatalogConfig {
    pub fn ephemeral_ttl(&self) -> Duration {
        Duration::from_secs(self.ephemeral_ttl_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Attempts before a session is marked failed
    pub max_retries: u32,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Cap on the doubled delay
    pub max_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Time between checks
    pub interval_ms: u64,
    /// Consecutive failures before a server is unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            failure_threshold: 3,
        }
    }
}

/// A backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable server identifier
    pub id: String,
    /// Display name, also the first half of semantic tool keys
    pub name: String,
    /// Owning project, if any
    #[serde(default)]
    pub project: Option<String>,
    /// Whether the server is started at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tools that callers may not execute
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    /// How to reach the server
    pub transport: TransportConfig,
    /// URL checked by the health checker
    #[serde(default)]
    pub health_check_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project: None,
            enabled: true,
            disabled_tools: Vec::new(),
            transport: TransportConfig::Stdio {
                command: command.into(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
            },
            health_check_url: None,
        }
    }

    /// Create a streamable HTTP server configuration.
    pub fn http(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project: None,
            enabled: true,
            disabled_tools: Vec::new(),
            transport: TransportConfig::Http {
                url: url.into(),
                credential_env: None,
            },
            health_check_url: None,
        }
    }

    /// Set the owning project.
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Resolve the credential sent to HTTP servers and health targets.
    pub fn resolve_credential(&self) -> Option<String> {
        match &self.transport {
            TransportConfig::Http {
                credential_env: Some(var),
                ..
            } => std::env::var(var).ok(),
            _ => None,
        }
    }
}

/// Transport used to reach a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON on stdio
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    /// Streamable HTTP endpoint
    Http {
        url: String,
        /// Environment variable holding a bearer credential
        #[serde(default)]
        credential_env: Option<String>,
    },
}

/// A caller token and the servers it may use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenGrant {
    /// Token value (prefer `token_env`)
    pub token: Option<String>,
    /// Environment variable holding the token
    pub token_env: Option<String>,
    /// Caller identity reported by validation
    pub client_id: String,
    /// Server ids this token may use, or "*"
    pub servers: Vec<String>,
}

impl TokenGrant {
    /// Resolve the token from either direct value or environment variable.
    pub fn resolve_token(&self) -> Option<String> {
        if let Some(ref token) = self.token {
            return Some(token.clone());
        }
        if let Some(ref env_var) = self.token_env {
            if let Ok(token) = std::env::var(env_var) {
                return Some(token);
            }
        }
        None
    }

    /// Whether the grant covers every server.
    pub fn grants_all(&self) -> bool {
        self.servers.iter().any(|s| s == ALL_SERVERS)
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Error).collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == IssueSeverity::Warning).collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "catalog.call_timeout_secs")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Layered configuration sources, lowest precedence first.
    pub fn figment() -> Figment {
        let config_dir = Self::config_dir();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_dir.join("config.toml")))
            .merge(Toml::file(".toolhub/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".toolhub/config.local.toml"))
            .merge(Env::prefixed("TOOLHUB_").split("__"))
    }

    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// Load configuration from an explicit file, still honouring env overrides.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TOOLHUB_").split("__"))
            .extract()
    }

    /// Load and validate configuration.
    pub fn load_validated(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
        .map_err(|e| Error::Config(e.to_string()))?;

        let result = config.validate();
        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Validation(errors.join("\n  ")));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        let valid_schemes = ["semantic", "ephemeral", "migrating"];
        if !valid_schemes.contains(&self.catalog.tool_key_scheme.as_str()) {
            result.add_error(
                "catalog.tool_key_scheme",
                format!(
                    "Invalid tool key scheme '{}'. Valid values: {:?}",
                    self.catalog.tool_key_scheme, valid_schemes
                ),
            );
        }

        let valid_primaries = ["semantic", "ephemeral"];
        if !valid_primaries.contains(&self.catalog.migrating_primary.as_str()) {
            result.add_error(
                "catalog.migrating_primary",
                format!(
                    "Invalid migrating primary '{}'. Valid values: {:?}",
                    self.catalog.migrating_primary, valid_primaries
                ),
            );
        }

        if self.catalog.ephemeral_ttl_secs == 0 {
            result.add_error("catalog.ephemeral_ttl_secs", "ephemeral_ttl_secs must be greater than 0");
        }

        if self.catalog.max_results_limit == 0 {
            result.add_error("catalog.max_results_limit", "max_results_limit must be greater than 0");
        }

        if self.catalog.default_max_results == 0
            || self.catalog.default_max_results > self.catalog.max_results_limit
        {
            result.add_error(
                "catalog.default_max_results",
                "default_max_results must be between 1 and max_results_limit",
            );
        }

        if self.catalog.call_timeout_secs == 0 {
            result.add_error("catalog.call_timeout_secs", "call_timeout_secs must be greater than 0");
        }

        if self.reconnect.initial_delay_ms == 0 {
            result.add_error("reconnect.initial_delay_ms", "initial_delay_ms must be greater than 0");
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            result.add_error(
                "reconnect.max_delay_ms",
                "max_delay_ms cannot be smaller than initial_delay_ms",
            );
        }

        if self.reconnect.max_retries == 0 {
            result.add_warning(
                "reconnect.max_retries",
                "max_retries is 0, lost sessions will fail without reconnecting",
            );
        }

        if self.health.failure_threshold == 0 {
            result.add_error("health.failure_threshold", "failure_threshold must be greater than 0");
        }

        if self.health.interval_ms < 1_000 {
            result.add_warning("health.interval_ms", "interval_ms below 1s will check very aggressively");
        }

        self.validate_servers(&mut result);
        self.validate_tokens(&mut result);

        result
    }

    fn validate_servers(&self, result: &mut ValidationResult) {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for (i, server) in self.servers.iter().enumerate() {
            let field = format!("servers[{}]", i);

            if server.id.trim().is_empty() {
                result.add_error(format!("{}.id", field), "Server id cannot be empty");
            } else if !ids.insert(server.id.clone()) {
                result.add_error(format!("{}.id", field), format!("Duplicate server id '{}'", server.id));
            }

            if server.name.trim().is_empty() {
                result.add_error(format!("{}.name", field), "Server name cannot be empty");
            } else if server.name.contains(':') {
                result.add_error(
                    format!("{}.name", field),
                    "Server name cannot contain ':' (it separates server and tool in tool keys)",
                );
            } else if !names.insert(server.name.to_lowercase()) {
                result.add_warning(
                    format!("{}.name", field),
                    format!(
                        "Server name '{}' collides with an earlier server; tool keys resolve to the first one",
                        server.name
                    ),
                );
            }

            match &server.transport {
                TransportConfig::Stdio { command, .. } if command.trim().is_empty() => {
                    result.add_error(format!("{}.transport.command", field), "Command cannot be empty");
                }
                TransportConfig::Http { url, .. }
                    if !url.starts_with("http://") && !url.starts_with("https://") =>
                {
                    result.add_error(
                        format!("{}.transport.url", field),
                        "url must start with http:// or https://",
                    );
                }
                _ => {}
            }

            if let Some(ref url) = server.health_check_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    result.add_error(
                        format!("{}.health_check_url", field),
                        "health_check_url must start with http:// or https://",
                    );
                }
            }
        }
    }

    fn validate_tokens(&self, result: &mut ValidationResult) {
        let known: HashSet<&str> = self.servers.iter().map(|s| s.id.as_str()).collect();

        for (i, grant) in self.tokens.iter().enumerate() {
            let field = format!("tokens[{}]", i);

            if grant.token.as_ref().map(|t| t.is_empty()).unwrap_or(true) && grant.token_env.is_none() {
                result.add_error(format!("{}.token", field), "Either token or token_env must be set");
            }

            if grant.client_id.trim().is_empty() {
                result.add_error(format!("{}.client_id", field), "client_id cannot be empty");
            }

            for server in &grant.servers {
                if server != ALL_SERVERS && !known.contains(server.as_str()) {
                    result.add_warning(
                        format!("{}.servers", field),
                        format!("Grant references unknown server id '{}'", server),
                    );
                }
            }
        }
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("toolhub"))
            .unwrap_or_else(|| PathBuf::from("~/.config/toolhub"))
    }
}

impl ReconnectSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
