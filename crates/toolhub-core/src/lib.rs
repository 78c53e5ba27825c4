//! # toolhub-core
//!
//! Core types shared by the Toolhub crates.
//!
//! This crate provides:
//! - Layered configuration (defaults, user/project TOML files, environment)
//! - Configuration validation with errors and warnings
//! - The top-level error type with recovery suggestions

pub mod config;
pub mod error;

pub use config::{
    CatalogConfig, Config, HealthSettings, ReconnectSettings, ServerConfig, TokenGrant,
    TransportConfig,
};
pub use error::{Error, Result};
