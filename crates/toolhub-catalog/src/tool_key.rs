//! Tool key codecs.
//!
//! A tool key is the string a caller passes back to `execute`. Two encodings
//! exist:
//!
//! - **semantic**: `serverName:toolName`, stable, resolved by a
//!   case-insensitive server-name lookup.
//! - **ephemeral**: `tk_<hex>`, an opaque token that maps to a tool for a
//!   fixed time-to-live.
//!
//! A deployment picks one [`ToolKeyCodec`] at construction. The migrating
//! codec mints its configured primary encoding and accepts both.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use toolhub_core::CatalogConfig;

use crate::error::CatalogError;
use crate::ports::ServerRecord;

const EPHEMERAL_PREFIX: &str = "tk_";
const SEMANTIC_SEPARATOR: char = ':';

/// What a tool key points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedKey {
    pub server_id: String,
    pub tool_name: String,
}

impl ResolvedKey {
    pub fn new(server_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
        }
    }
}

/// Errors from resolving a tool key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolKeyError {
    #[error("malformed tool key: {0}")]
    Malformed(String),

    #[error("tool key expired: {0}")]
    Expired(String),

    #[error("unknown tool key: {0}")]
    NotFound(String),

    #[error("no server named '{name}'")]
    UnknownServer { key: String, name: String },
}

impl From<ToolKeyError> for CatalogError {
    fn from(e: ToolKeyError) -> Self {
        match e {
            ToolKeyError::Malformed(key) => CatalogError::MalformedToolKey { key },
            ToolKeyError::Expired(key) => CatalogError::ToolKeyExpired { key },
            ToolKeyError::NotFound(key) => CatalogError::ToolKeyNotFound { key },
            ToolKeyError::UnknownServer { name, .. } => CatalogError::ServerNotFound { server_id: name },
        }
    }
}

/// The encoding a codec mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheme {
    Semantic,
    Ephemeral,
    Migrating,
}

impl KeyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Ephemeral => "ephemeral",
            Self::Migrating => "migrating",
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyScheme {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "ephemeral" => Ok(Self::Ephemeral),
            "migrating" => Ok(Self::Migrating),
            other => Err(CatalogError::Internal(format!("unknown tool key scheme '{}'", other))),
        }
    }
}

/// Mints and resolves tool keys.
pub trait ToolKeyCodec: Send + Sync {
    fn scheme(&self) -> KeyScheme;

    /// Bring any server lookup state in line with the registered servers.
    fn sync_servers(&self, servers: &[ServerRecord]);

    fn mint(&self, server: &ServerRecord, tool_name: &str) -> String;

    fn resolve(&self, key: &str) -> Result<ResolvedKey, ToolKeyError>;
}

/// Build the codec named by `config.tool_key_scheme`.
pub fn codec_for(config: &CatalogConfig) -> Result<Arc<dyn ToolKeyCodec>, CatalogError> {
    let scheme: KeyScheme = config.tool_key_scheme.parse()?;
    Ok(match scheme {
        KeyScheme::Semantic => Arc::new(SemanticKeyCodec::new()),
        KeyScheme::Ephemeral => Arc::new(EphemeralKeyCodec::new(config.ephemeral_ttl())),
        KeyScheme::Migrating => {
            let codec = MigratingKeyCodec::new(config.ephemeral_ttl());
            match config.migrating_primary.parse::<KeyScheme>()? {
                KeyScheme::Semantic => Arc::new(codec),
                KeyScheme::Ephemeral => Arc::new(codec.minting_ephemeral()),
                KeyScheme::Migrating => {
                    return Err(CatalogError::Internal(
                        "migrating_primary must be semantic or ephemeral".to_string(),
                    ))
                }
            }
        }
    })
}

#[derive(Debug, Default)]
struct NameTable {
    fingerprint: String,
    ids_by_name: HashMap<String, String>,
}

/// `serverName:toolName` keys.
#[derive(Debug, Default)]
pub struct SemanticKeyCodec {
    table: RwLock<NameTable>,
}

impl SemanticKeyCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn fingerprint(servers: &[ServerRecord]) -> String {
        servers
            .iter()
            .map(|s| format!("{}={}", s.id, s.name))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of distinct server names currently resolvable.
    pub fn known_names(&self) -> usize {
        self.table.read().ids_by_name.len()
    }
}

impl ToolKeyCodec for SemanticKeyCodec {
    fn scheme(&self) -> KeyScheme {
        KeyScheme::Semantic
    }

    fn sync_servers(&self, servers: &[ServerRecord]) {
        let fingerprint = Self::fingerprint(servers);
        if self.table.read().fingerprint == fingerprint {
            return;
        }

        let mut ids_by_name = HashMap::with_capacity(servers.len());
        for server in servers {
            // First registration wins on a case-insensitive name collision
            ids_by_name
                .entry(server.name.to_lowercase())
                .or_insert_with(|| server.id.clone());
        }
        debug!(servers = servers.len(), names = ids_by_name.len(), "Rebuilt server name table");

        *self.table.write() = NameTable {
            fingerprint,
            ids_by_name,
        };
    }

    fn mint(&self, server: &ServerRecord, tool_name: &str) -> String {
        format!("{}{}{}", server.name, SEMANTIC_SEPARATOR, tool_name)
    }

    fn resolve(&self, key: &str) -> Result<ResolvedKey, ToolKeyError> {
        let (server_name, tool_name) = key
            .split_once(SEMANTIC_SEPARATOR)
            .filter(|(server, tool)| !server.trim().is_empty() && !tool.trim().is_empty())
            .ok_or_else(|| ToolKeyError::Malformed(key.to_string()))?;

        let table = self.table.read();
        let server_id = table
            .ids_by_name
            .get(&server_name.to_lowercase())
            .ok_or_else(|| ToolKeyError::UnknownServer {
                key: key.to_string(),
                name: server_name.to_string(),
            })?;

        Ok(ResolvedKey::new(server_id.clone(), tool_name))
    }
}

#[derive(Debug, Clone)]
struct EphemeralEntry {
    target: ResolvedKey,
    created_at: Instant,
}

/// Opaque `tk_<hex>` keys valid for a fixed time-to-live.
#[derive(Debug)]
pub struct EphemeralKeyCodec {
    ttl: Duration,
    entries: RwLock<HashMap<String, EphemeralEntry>>,
}

impl EphemeralKeyCodec {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn is_well_formed(key: &str) -> bool {
        key.strip_prefix(EPHEMERAL_PREFIX)
            .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()))
    }

    fn is_expired(&self, entry: &EphemeralEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) >= self.ttl
    }
}

impl ToolKeyCodec for EphemeralKeyCodec {
    fn scheme(&self) -> KeyScheme {
        KeyScheme::Ephemeral
    }

    fn sync_servers(&self, _servers: &[ServerRecord]) {}

    fn mint(&self, server: &ServerRecord, tool_name: &str) -> String {
        let now = Instant::now();
        let key = format!("{}{}", EPHEMERAL_PREFIX, Uuid::new_v4().simple());

        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.created_at) < self.ttl);
        if entries.len() < before {
            debug!(removed = before - entries.len(), "Collected expired tool keys");
        }
        entries.insert(
            key.clone(),
            EphemeralEntry {
                target: ResolvedKey::new(&server.id, tool_name),
                created_at: now,
            },
        );
        key
    }

    fn resolve(&self, key: &str) -> Result<ResolvedKey, ToolKeyError> {
        if !Self::is_well_formed(key) {
            return Err(ToolKeyError::Malformed(key.to_string()));
        }

        let now = Instant::now();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return Err(ToolKeyError::NotFound(key.to_string())),
                Some(entry) if !self.is_expired(entry, now) => return Ok(entry.target.clone()),
                Some(_) => {}
            }
        }

        self.entries.write().remove(key);
        Err(ToolKeyError::Expired(key.to_string()))
    }
}

/// Resolves both encodings; mints the primary one (semantic by default).
///
/// Ephemeral keys minted here land in the same table `resolve` reads, so
/// either direction of a migration keeps earlier keys working.
#[derive(Debug)]
pub struct MigratingKeyCodec {
    semantic: SemanticKeyCodec,
    ephemeral: EphemeralKeyCodec,
    primary: KeyScheme,
}

impl MigratingKeyCodec {
    pub fn new(ephemeral_ttl: Duration) -> Self {
        Self {
            semantic: SemanticKeyCodec::new(),
            ephemeral: EphemeralKeyCodec::new(ephemeral_ttl),
            primary: KeyScheme::Semantic,
        }
    }

    /// Mint ephemeral keys instead of semantic ones.
    pub fn minting_ephemeral(mut self) -> Self {
        self.primary = KeyScheme::Ephemeral;
        self
    }

    /// The encoding `mint` produces.
    pub fn primary(&self) -> KeyScheme {
        self.primary
    }

    pub fn ephemeral(&self) -> &EphemeralKeyCodec {
        &self.ephemeral
    }
}

impl ToolKeyCodec for MigratingKeyCodec {
    fn scheme(&self) -> KeyScheme {
        KeyScheme::Migrating
    }

    fn sync_servers(&self, servers: &[ServerRecord]) {
        self.semantic.sync_servers(servers);
    }

    fn mint(&self, server: &ServerRecord, tool_name: &str) -> String {
        match self.primary {
            KeyScheme::Ephemeral => self.ephemeral.mint(server, tool_name),
            _ => self.semantic.mint(server, tool_name),
        }
    }

    fn resolve(&self, key: &str) -> Result<ResolvedKey, ToolKeyError> {
        if key.starts_with(EPHEMERAL_PREFIX) && !key.contains(SEMANTIC_SEPARATOR) {
            self.ephemeral.resolve(key)
        } else {
            self.semantic.resolve(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<ServerRecord> {
        vec![
            ServerRecord::new("srv-1", "GitHub"),
            ServerRecord::new("srv-2", "filesystem"),
            ServerRecord::new("srv-3", "github"),
        ]
    }

    #[test]
    fn test_semantic_lookup_is_case_insensitive() {
        let codec = SemanticKeyCodec::new();
        codec.sync_servers(&servers());

        let upper = codec.resolve("GitHub:create_issue").unwrap();
        let lower = codec.resolve("github:create_issue").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper, ResolvedKey::new("srv-1", "create_issue"));
    }

    #[test]
    fn test_semantic_first_registered_wins() {
        let codec = SemanticKeyCodec::new();
        codec.sync_servers(&servers());
        assert_eq!(codec.known_names(), 2);
        assert_eq!(codec.resolve("GITHUB:x").unwrap().server_id, "srv-1");
    }

    #[test]
    fn test_semantic_table_rebuilt_when_servers_change() {
        let codec = SemanticKeyCodec::new();
        codec.sync_servers(&servers());

        let mut changed = servers();
        changed.remove(0);
        codec.sync_servers(&changed);

        assert_eq!(codec.resolve("github:x").unwrap().server_id, "srv-3");
    }

    #[test]
    fn test_semantic_errors() {
        let codec = SemanticKeyCodec::new();
        codec.sync_servers(&servers());

        assert!(matches!(codec.resolve("no-separator"), Err(ToolKeyError::Malformed(_))));
        assert!(matches!(codec.resolve(":tool"), Err(ToolKeyError::Malformed(_))));
        assert!(matches!(codec.resolve("github:"), Err(ToolKeyError::Malformed(_))));
        assert!(matches!(
            codec.resolve("zzz:tool"),
            Err(ToolKeyError::UnknownServer { ref name, .. }) if name == "zzz"
        ));
    }

    #[test]
    fn test_semantic_tool_name_may_contain_separator() {
        let codec = SemanticKeyCodec::new();
        codec.sync_servers(&servers());
        let key = codec.mint(&servers()[1], "read:file");
        assert_eq!(codec.resolve(&key).unwrap().tool_name, "read:file");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_expires_at_ttl() {
        let codec = EphemeralKeyCodec::new(Duration::from_secs(60));
        let key = codec.mint(&servers()[0], "create_issue");
        assert!(key.starts_with("tk_"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(codec.resolve(&key).unwrap(), ResolvedKey::new("srv-1", "create_issue"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(codec.resolve(&key), Err(ToolKeyError::Expired(key.clone())));

        // Deleted on the expired lookup
        assert_eq!(codec.resolve(&key), Err(ToolKeyError::NotFound(key.clone())));
        assert!(codec.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_collects_expired_on_mint() {
        let codec = EphemeralKeyCodec::new(Duration::from_secs(10));
        codec.mint(&servers()[0], "a");
        codec.mint(&servers()[0], "b");
        assert_eq!(codec.len(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        codec.mint(&servers()[1], "c");
        assert_eq!(codec.len(), 1);
    }

    #[test]
    fn test_ephemeral_malformed_vs_unknown() {
        let codec = EphemeralKeyCodec::new(Duration::from_secs(10));
        assert!(matches!(codec.resolve("github:create_issue"), Err(ToolKeyError::Malformed(_))));
        assert!(matches!(codec.resolve("tk_short"), Err(ToolKeyError::Malformed(_))));

        let unknown = format!("tk_{}", Uuid::new_v4().simple());
        assert!(matches!(codec.resolve(&unknown), Err(ToolKeyError::NotFound(_))));
    }

    #[test]
    fn test_migrating_accepts_both_encodings() {
        let codec = MigratingKeyCodec::new(Duration::from_secs(60));
        codec.sync_servers(&servers());

        let semantic = codec.mint(&servers()[1], "read_file");
        assert_eq!(semantic, "filesystem:read_file");

        let ephemeral = codec.ephemeral().mint(&servers()[1], "read_file");
        assert_eq!(codec.resolve(&semantic).unwrap(), codec.resolve(&ephemeral).unwrap());
    }

    #[test]
    fn test_migrating_ephemeral_primary_resolves_its_own_keys() {
        let codec = MigratingKeyCodec::new(Duration::from_secs(60)).minting_ephemeral();
        codec.sync_servers(&servers());

        let key = codec.mint(&servers()[1], "read_file");
        assert!(key.starts_with("tk_"));
        assert_eq!(codec.ephemeral().len(), 1);
        assert_eq!(codec.resolve(&key).unwrap(), ResolvedKey::new("srv-2", "read_file"));
        assert_eq!(
            codec.resolve("filesystem:read_file").unwrap(),
            ResolvedKey::new("srv-2", "read_file")
        );
    }

    #[test]
    fn test_codec_for_config() {
        let mut config = CatalogConfig::default();
        assert_eq!(codec_for(&config).unwrap().scheme(), KeyScheme::Semantic);

        config.tool_key_scheme = "Ephemeral".to_string();
        assert_eq!(codec_for(&config).unwrap().scheme(), KeyScheme::Ephemeral);

        config.tool_key_scheme = "migrating".to_string();
        config.migrating_primary = "ephemeral".to_string();
        let codec = codec_for(&config).unwrap();
        assert_eq!(codec.scheme(), KeyScheme::Migrating);
        assert!(codec.mint(&servers()[0], "x").starts_with("tk_"));

        config.migrating_primary = "migrating".to_string();
        assert!(codec_for(&config).is_err());

        config.tool_key_scheme = "rot13".to_string();
        assert!(codec_for(&config).is_err());
    }

    #[test]
    fn test_errors_map_to_catalog_codes() {
        let err: CatalogError = ToolKeyError::Expired("tk_x".to_string()).into();
        assert_eq!(err.code(), "TOOL_KEY_EXPIRED");

        let err: CatalogError = ToolKeyError::UnknownServer {
            key: "zzz:t".to_string(),
            name: "zzz".to_string(),
        }
        .into();
        assert_eq!(err.code(), "SERVER_NOT_FOUND");
    }
}
