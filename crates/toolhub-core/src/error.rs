//! Top-level errors reported by the `toolhub` binary.
//!
//! Library crates keep their own typed errors. This one carries a recovery
//! hint for the operator where one is known.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configuration loaded but failed validation.
    #[error("Configuration validation failed:\n  {0}")]
    Validation(String),

    /// A backend session failed.
    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// What the operator can do about this error.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => Some("Check ~/.config/toolhub/config.toml and TOOLHUB_* variables"),
            Error::Validation(_) => Some("Run 'toolhub config validate' for details"),
            Error::Mcp(_) => Some("Run 'toolhub doctor' to check server connectivity"),
            Error::Io(_) => None,
        }
    }
}

/// Render `error` followed by its recovery suggestion, if any.
pub fn format_error_with_suggestion(error: &Error) -> String {
    match error.recovery_suggestion() {
        Some(suggestion) => format!("{}\n  Suggestion: {}", error, suggestion),
        None => error.to_string(),
    }
}
