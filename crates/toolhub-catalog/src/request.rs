//! Request envelope for the catalog operations.
//!
//! Requests arrive as JSON tagged by `operation`:
//!
//! ```json
//! {"operation": "discover", "token": "...", "query": ["create", "issue"]}
//! {"operation": "execute", "token": "...", "toolKey": "github:create_issue", "arguments": {}}
//! {"operation": "capabilities", "token": "...", "category": "development"}
//! ```
//!
//! Every request is validated before it reaches the handler.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::category::ToolCategory;
use crate::error::{CatalogError, Result};
use crate::index::DetailLevel;

/// Project value that means "no project".
pub const UNASSIGNED_PROJECT: &str = "unassigned";

/// Who is calling and in which project scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

impl CallerContext {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            project: None,
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// The project filter, if any. Empty and `"unassigned"` mean none.
    pub fn project_filter(&self) -> Option<&str> {
        normalize_project(self.project.as_deref())
    }
}

pub fn normalize_project(project: Option<&str>) -> Option<&str> {
    project
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.eq_ignore_ascii_case(UNASSIGNED_PROJECT))
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => s.split_whitespace().map(String::from).collect(),
        OneOrMany::Many(v) => v,
    })
}

/// Search the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverRequest {
    /// Keywords; a single string is split on whitespace
    #[serde(deserialize_with = "one_or_many")]
    pub query: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_level: Option<DetailLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl DiscoverRequest {
    pub fn new<I, S>(query: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: query.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, level: DetailLevel) -> Self {
        self.detail_level = Some(level);
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.iter().all(|k| k.trim().is_empty()) {
            return Err(CatalogError::InvalidRequest(
                "query needs at least one keyword".to_string(),
            ));
        }
        if self.max_results == Some(0) {
            return Err(CatalogError::InvalidRequest(
                "maxResults must be at least 1".to_string(),
            ));
        }
        parse_category(self.category.as_deref())?;
        Ok(())
    }

    pub fn category(&self) -> Result<Option<ToolCategory>> {
        parse_category(self.category.as_deref())
    }
}

/// Call one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub tool_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl ExecuteRequest {
    pub fn new(tool_key: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            tool_key: tool_key.into(),
            arguments,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tool_key.trim().is_empty() {
            return Err(CatalogError::InvalidRequest("toolKey is required".to_string()));
        }
        match self.arguments {
            None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(CatalogError::InvalidRequest(
                "arguments must be a JSON object".to_string(),
            )),
        }
    }
}

/// Summarize what the caller can reach.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesRequest {
    /// Server id or name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl CapabilitiesRequest {
    pub fn validate(&self) -> Result<()> {
        parse_category(self.category.as_deref()).map(|_| ())
    }

    pub fn category(&self) -> Result<Option<ToolCategory>> {
        parse_category(self.category.as_deref())
    }
}

fn parse_category(category: Option<&str>) -> Result<Option<ToolCategory>> {
    match category.map(str::trim).filter(|c| !c.is_empty()) {
        None => Ok(None),
        Some(c) => c.parse().map(Some).map_err(CatalogError::InvalidRequest),
    }
}

/// One catalog operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CatalogRequest {
    Discover(DiscoverRequest),
    Execute(ExecuteRequest),
    Capabilities(CapabilitiesRequest),
}

impl CatalogRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Discover(_) => "discover",
            Self::Execute(_) => "execute",
            Self::Capabilities(_) => "capabilities",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Discover(r) => r.validate(),
            Self::Execute(r) => r.validate(),
            Self::Capabilities(r) => r.validate(),
        }
    }
}

/// A request together with its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(flatten)]
    pub caller: CallerContext,
    #[serde(flatten)]
    pub request: CatalogRequest,
}

impl RequestEnvelope {
    pub fn new(caller: CallerContext, request: CatalogRequest) -> Self {
        Self { caller, request }
    }

    /// Parse a JSON envelope, mapping syntax errors to `INVALID_REQUEST`.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| CatalogError::InvalidRequest(e.to_string()))
    }
}
