//! The catalog's three caller-facing operations.
//!
//! - `discover` searches the live tool set the caller may use.
//! - `execute` resolves a tool key and calls the tool on its session.
//! - `capabilities` lists tools on every reachable server and summarizes
//!   them by category.
//!
//! Every operation authenticates the caller first. Failures come back as
//! [`CatalogError`]s, which [`ToolCatalogHandler::handle`] renders into
//! error responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use toolhub_core::CatalogConfig;
use toolhub_mcp::protocol::JsonRpcError;
use toolhub_mcp::{ConnectionState, McpError, McpToolDefinition, SessionClient};

use crate::category::{categorize, ToolCategory};
use crate::context::{CatalogContext, CatalogOptions};
use crate::error::{CatalogError, Result};
use crate::index::{DetailLevel, DiscoveredTool, SearchQuery, ToolIndex, ToolRecord};
use crate::ports::ServerRecord;
use crate::request::{
    CallerContext, CapabilitiesRequest, CatalogRequest, DiscoverRequest, ExecuteRequest,
    RequestEnvelope,
};
use crate::response::{rewrite_resource_links, ToolResponse};
use crate::tool_key::{codec_for, ToolKeyCodec};

/// Examples listed per category in a capabilities summary.
const CATEGORY_EXAMPLES: usize = 3;

/// Result of `discover`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub query: Vec<String>,
    pub detail_level: DetailLevel,
    pub total: usize,
    pub tools: Vec<DiscoveredTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// How a server fared during a capabilities fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRunState {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub server_id: String,
    pub name: String,
    pub status: ServerRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    pub tool_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub category: ToolCategory,
    pub count: usize,
    pub examples: Vec<String>,
}

/// Result of `capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesResponse {
    pub total_servers: usize,
    pub running_servers: usize,
    pub total_tools: usize,
    /// Sorted by descending tool count
    pub categories: Vec<CategorySummary>,
    /// Sorted by descending tool count
    pub servers: Vec<ServerSummary>,
}

/// Token-checked, project-scoped access to every backend's tools.
pub struct ToolCatalogHandler {
    context: CatalogContext,
    codec: Arc<dyn ToolKeyCodec>,
    index: ToolIndex,
    options: CatalogOptions,
}

impl ToolCatalogHandler {
    pub fn new(context: CatalogContext, codec: Arc<dyn ToolKeyCodec>, options: CatalogOptions) -> Self {
        info!(scheme = %codec.scheme(), "Tool catalog ready");
        Self {
            context,
            codec,
            index: ToolIndex::new(),
            options,
        }
    }

    /// Build with the codec and options named in `config`.
    pub fn from_config(context: CatalogContext, config: &CatalogConfig) -> Result<Self> {
        let codec = codec_for(config)?;
        Ok(Self::new(context, codec, CatalogOptions::from(config)))
    }

    pub fn context(&self) -> &CatalogContext {
        &self.context
    }

    pub fn codec(&self) -> &dyn ToolKeyCodec {
        self.codec.as_ref()
    }

    pub fn index(&self) -> &ToolIndex {
        &self.index
    }

    /// Run one request, rendering any failure as an error response.
    pub async fn handle(&self, envelope: RequestEnvelope) -> ToolResponse {
        let RequestEnvelope { caller, request } = envelope;
        let operation = request.operation();
        debug!(operation, "Handling catalog request");

        let outcome = match request {
            CatalogRequest::Discover(r) => self.discover(&caller, r).await.and_then(to_json_response),
            CatalogRequest::Execute(r) => self.execute(&caller, r).await,
            CatalogRequest::Capabilities(r) => {
                self.capabilities(&caller, r).await.and_then(to_json_response)
            }
        };

        outcome.unwrap_or_else(|e| {
            debug!(operation, code = e.code(), "Catalog request rejected");
            ToolResponse::error(&e)
        })
    }

    /// Search the tools the caller may use.
    pub async fn discover(&self, caller: &CallerContext, request: DiscoverRequest) -> Result<DiscoverResponse> {
        let token = self.authenticate(caller).await?;
        request.validate()?;
        let category = request.category()?;
        let detail_level = request.detail_level.unwrap_or_default();

        let servers = self.context.servers.list_servers().await?;
        let allowed = self.allowed_servers(&token, caller.project_filter(), &servers).await?;
        self.refresh_index(&servers).await;

        let query = SearchQuery::new(request.query.clone(), self.options.result_limit(request.max_results))
            .with_context(request.context.clone())
            .allowed(allowed.iter().map(|s| s.id.clone()).collect())
            .in_project(caller.project_filter().map(String::from))
            .in_category(category);
        let hits = self.index.search(&query);

        self.codec.sync_servers(&servers);
        let tools: Vec<DiscoveredTool> = hits
            .iter()
            .filter_map(|hit| {
                let server = allowed.iter().find(|s| s.id == hit.record.server_id)?;
                let key = self.codec.mint(server, &hit.record.tool_name);
                Some(hit.shape(key, detail_level, self.options.description_preview_chars))
            })
            .collect();

        let hint = if allowed.is_empty() {
            Some("This token has no accessible servers in the current project".to_string())
        } else if tools.is_empty() {
            Some("No tools matched; try broader keywords or call capabilities".to_string())
        } else {
            None
        };

        debug!(keywords = ?request.query, results = tools.len(), "Discover finished");
        Ok(DiscoverResponse {
            query: request.query,
            detail_level,
            total: tools.len(),
            tools,
            hint,
        })
    }

    /// Call the tool behind `request.tool_key`.
    ///
    /// Checks run in a fixed order: the server exists, the caller may use
    /// it, it belongs to the caller's project, the tool is enabled, the
    /// server has a live session, the server is running.
    pub async fn execute(&self, caller: &CallerContext, request: ExecuteRequest) -> Result<ToolResponse> {
        let outcome = self.execute_checked(caller, &request).await;
        if let Err(ref e) = outcome {
            warn!(tool_key = %request.tool_key, code = e.code(), error = %e, "Execute rejected");
        }
        outcome
    }

    async fn execute_checked(&self, caller: &CallerContext, request: &ExecuteRequest) -> Result<ToolResponse> {
        let token = self.authenticate(caller).await?;
        request.validate()?;

        let servers = self.context.servers.list_servers().await?;
        self.codec.sync_servers(&servers);
        let target = self.codec.resolve(request.tool_key.trim())?;

        let server = servers
            .iter()
            .find(|s| s.id == target.server_id)
            .ok_or_else(|| CatalogError::ServerNotFound {
                server_id: target.server_id.clone(),
            })?;

        if !self.context.tokens.has_access(&token, &server.id).await? {
            return Err(CatalogError::AccessDenied {
                server_id: server.id.clone(),
                server_name: server.name.clone(),
            });
        }

        if let Some(project) = caller.project_filter() {
            if server.project_id.as_deref() != Some(project) {
                return Err(CatalogError::ProjectMismatch {
                    server_name: server.name.clone(),
                    server_project: server.project_id.clone(),
                    caller_project: Some(project.to_string()),
                });
            }
        }

        if !server.is_tool_enabled(&target.tool_name) {
            return Err(CatalogError::ToolDisabled {
                server_name: server.name.clone(),
                tool: target.tool_name.clone(),
            });
        }

        let session = self.context.sessions.get(&server.id).ok_or_else(|| {
            CatalogError::ServerNotConnected {
                server_name: server.name.clone(),
                state: None,
            }
        })?;
        let state = session.state();
        if state != ConnectionState::Connected || session.connection().is_none() {
            return Err(CatalogError::ServerNotConnected {
                server_name: server.name.clone(),
                state: Some(state),
            });
        }

        if !self.context.running.is_running(&server.name) {
            return Err(CatalogError::ServerNotRunning {
                server_name: server.name.clone(),
            });
        }

        info!(server = %server.name, tool = %target.tool_name, "Executing tool");
        let arguments = request.arguments.clone().filter(|a| !a.is_null());
        match session
            .call_tool_with_timeout(&target.tool_name, arguments, self.options.call_timeout)
            .await
        {
            Ok(mut result) => {
                rewrite_resource_links(&mut result, &server.name);
                Ok(ToolResponse::from_call_result(result))
            }
            Err(e) => Err(self.call_failure(e, &session, server, &target.tool_name, &servers).await),
        }
    }

    async fn call_failure(
        &self,
        error: McpError,
        session: &SessionClient,
        server: &ServerRecord,
        tool: &str,
        servers: &[ServerRecord],
    ) -> CatalogError {
        match error {
            McpError::Timeout(seconds) => CatalogError::ToolTimeout {
                server_name: server.name.clone(),
                tool: tool.to_string(),
                seconds,
            },
            McpError::ServerError { code, ref message } if is_unknown_tool(code, message) => {
                self.refresh_index(servers).await;
                let suggestions = self
                    .index
                    .similar_tools(&server.id, tool, self.options.max_suggestions)
                    .iter()
                    .map(|r| self.codec.mint(server, &r.tool_name))
                    .collect();
                CatalogError::ToolNotFound {
                    server_name: server.name.clone(),
                    tool: tool.to_string(),
                    suggestions,
                }
            }
            McpError::ServerError { message, .. } => CatalogError::ToolExecutionFailed {
                server_name: server.name.clone(),
                tool: tool.to_string(),
                message,
            },
            McpError::NotConnected(_) | McpError::Disposed(_) | McpError::Transport(_) => {
                CatalogError::ServerNotConnected {
                    server_name: server.name.clone(),
                    state: Some(session.state()),
                }
            }
            other => CatalogError::ToolExecutionFailed {
                server_name: server.name.clone(),
                tool: tool.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// List and summarize the tools the caller can reach.
    pub async fn capabilities(
        &self,
        caller: &CallerContext,
        request: CapabilitiesRequest,
    ) -> Result<CapabilitiesResponse> {
        let token = self.authenticate(caller).await?;
        request.validate()?;
        let category = request.category()?;

        let servers = self.context.servers.list_servers().await?;
        let project = caller.project_filter();
        let mut selected = self.allowed_servers(&token, project, &servers).await?;

        if let Some(ref wanted) = request.server {
            let server = servers
                .iter()
                .find(|s| s.id == *wanted || s.name.eq_ignore_ascii_case(wanted))
                .ok_or_else(|| CatalogError::ServerNotFound {
                    server_id: wanted.clone(),
                })?;
            if !selected.iter().any(|s| s.id == server.id) {
                return Err(if self.context.tokens.has_access(&token, &server.id).await? {
                    CatalogError::ProjectMismatch {
                        server_name: server.name.clone(),
                        server_project: server.project_id.clone(),
                        caller_project: project.map(String::from),
                    }
                } else {
                    CatalogError::AccessDenied {
                        server_id: server.id.clone(),
                        server_name: server.name.clone(),
                    }
                });
            }
            selected.retain(|s| s.id == server.id);
        }

        let listings = join_all(selected.iter().map(|server| self.list_server_tools(server))).await;

        let mut by_category: BTreeMap<ToolCategory, Vec<String>> = BTreeMap::new();
        let mut summaries = Vec::with_capacity(listings.len());
        for (server, mut summary, tools) in listings {
            let mut count = 0;
            for tool in tools.into_iter().filter(|t| server.is_tool_enabled(&t.name)) {
                let tool_category = categorize(&server.name, &tool.name, tool.description.as_deref());
                if category.is_some_and(|c| c != tool_category) {
                    continue;
                }
                by_category.entry(tool_category).or_default().push(tool.name);
                count += 1;
            }
            summary.tool_count = count;
            summaries.push(summary);
        }

        summaries.sort_by(|a, b| b.tool_count.cmp(&a.tool_count).then_with(|| a.name.cmp(&b.name)));

        let mut categories: Vec<CategorySummary> = by_category
            .into_iter()
            .map(|(category, names)| CategorySummary {
                category,
                count: names.len(),
                examples: names.into_iter().take(CATEGORY_EXAMPLES).collect(),
            })
            .collect();
        // Stable sort keeps the category order for equal counts
        categories.sort_by(|a, b| b.count.cmp(&a.count));

        let response = CapabilitiesResponse {
            total_servers: summaries.len(),
            running_servers: summaries
                .iter()
                .filter(|s| s.status == ServerRunState::Running)
                .count(),
            total_tools: summaries.iter().map(|s| s.tool_count).sum(),
            categories,
            servers: summaries,
        };
        debug!(
            servers = response.total_servers,
            tools = response.total_tools,
            "Capabilities collected"
        );
        Ok(response)
    }

    /// One server's share of the capabilities fan-out. Never fails; a
    /// failed listing is reported in the summary.
    async fn list_server_tools<'a>(
        &self,
        server: &'a ServerRecord,
    ) -> (&'a ServerRecord, ServerSummary, Vec<McpToolDefinition>) {
        let mut summary = ServerSummary {
            server_id: server.id.clone(),
            name: server.name.clone(),
            status: ServerRunState::Stopped,
            connection: None,
            tool_count: 0,
            error: None,
        };

        let Some(session) = self.context.sessions.get(&server.id) else {
            return (server, summary, Vec::new());
        };
        let state = session.state();
        summary.connection = Some(state);
        match state {
            ConnectionState::Connected => {}
            // Lost after it was up
            ConnectionState::Reconnecting | ConnectionState::Failed => {
                summary.status = ServerRunState::Error;
                summary.error = Some(format!("connection {}", state));
                return (server, summary, Vec::new());
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                return (server, summary, Vec::new());
            }
        }

        match session.list_tools().await {
            Ok(tools) => {
                summary.status = ServerRunState::Running;
                (server, summary, tools)
            }
            Err(e) => {
                warn!(server = %server.name, error = %e, "Listing tools failed");
                summary.status = ServerRunState::Error;
                summary.error = Some(e.to_string());
                (server, summary, Vec::new())
            }
        }
    }

    async fn authenticate(&self, caller: &CallerContext) -> Result<String> {
        let token = caller
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CatalogError::InvalidToken)?;

        let validation = self.context.tokens.validate(token).await?;
        if !validation.is_valid {
            return Err(CatalogError::InvalidToken);
        }
        debug!(client_id = ?validation.client_id, "Caller authenticated");
        Ok(token.to_string())
    }

    /// Servers the token may use within `project`, in registration order.
    async fn allowed_servers(
        &self,
        token: &str,
        project: Option<&str>,
        servers: &[ServerRecord],
    ) -> Result<Vec<ServerRecord>> {
        let checks = join_all(
            servers
                .iter()
                .map(|s| self.context.tokens.has_access(token, &s.id)),
        )
        .await;

        let mut allowed = Vec::new();
        for (server, access) in servers.iter().zip(checks) {
            let in_project = project.map_or(true, |p| server.project_id.as_deref() == Some(p));
            if access? && in_project {
                allowed.push(server.clone());
            }
        }
        Ok(allowed)
    }

    /// Feed the index every enabled tool on every connected session.
    async fn refresh_index(&self, servers: &[ServerRecord]) {
        let listings = servers.iter().filter_map(|server| {
            let session = self.context.sessions.get(&server.id)?;
            if session.state() != ConnectionState::Connected {
                return None;
            }
            Some(async move {
                let tools = match session.cached_tools() {
                    Some(tools) => Ok(tools),
                    None => session.list_tools().await,
                };
                (server, tools)
            })
        });

        let mut records = Vec::new();
        for (server, tools) in join_all(listings).await {
            match tools {
                Ok(tools) => records.extend(
                    tools
                        .into_iter()
                        .filter(|t| server.is_tool_enabled(&t.name))
                        .map(|t| ToolRecord::from_definition(server, t)),
                ),
                Err(e) => warn!(server = %server.name, error = %e, "Skipping server in tool index"),
            }
        }

        self.index.refresh(records);
    }
}

fn to_json_response<T: Serialize>(value: T) -> Result<ToolResponse> {
    serde_json::to_value(value)
        .map(ToolResponse::json)
        .map_err(|e| CatalogError::Internal(e.to_string()))
}

/// Whether a backend error says the tool does not exist.
fn is_unknown_tool(code: i32, message: &str) -> bool {
    let message = message.to_lowercase();
    let says_missing = message.contains("unknown tool")
        || message.contains("tool not found")
        || (message.contains("not found") && message.contains("tool"));
    says_missing || (code == JsonRpcError::INVALID_PARAMS && message.contains("not found"))
}
