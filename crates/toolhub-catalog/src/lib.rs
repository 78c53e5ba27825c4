//! # toolhub-catalog
//!
//! A searchable, access-controlled catalog over live MCP sessions.
//!
//! This crate provides:
//! - `ToolCatalogHandler` with the `discover`, `execute` and `capabilities`
//!   operations
//! - A fuzzy, synonym-aware full-text `ToolIndex`
//! - Semantic, ephemeral and migrating tool key codecs
//! - Caller-facing errors with recovery guidance
//! - Token-validator and server-registry ports with in-memory adapters

pub mod category;
pub mod context;
pub mod error;
pub mod handler;
pub mod index;
pub mod memory;
pub mod ports;
pub mod request;
pub mod response;
pub mod text;
pub mod tool_key;

pub use category::ToolCategory;
pub use context::{CatalogContext, CatalogOptions};
pub use error::{CatalogError, ErrorPayload, Result};
pub use handler::{CapabilitiesResponse, DiscoverResponse, ServerRunState, ToolCatalogHandler};
pub use index::{DetailLevel, DiscoveredTool, SearchHit, SearchQuery, ToolIndex, ToolRecord};
pub use memory::{InMemoryServerRegistry, StaticTokenValidator};
pub use ports::{ServerRecord, ServerRegistry, TokenValidation, TokenValidator};
pub use request::{
    CallerContext, CapabilitiesRequest, CatalogRequest, DiscoverRequest, ExecuteRequest,
    RequestEnvelope,
};
pub use response::ToolResponse;
pub use tool_key::{
    codec_for, EphemeralKeyCodec, KeyScheme, MigratingKeyCodec, ResolvedKey, SemanticKeyCodec,
    ToolKeyCodec, ToolKeyError,
};
