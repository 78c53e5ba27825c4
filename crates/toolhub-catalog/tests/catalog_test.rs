//! End-to-end tests of the catalog handler over in-process MCP servers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use toolhub_catalog::{
    CallerContext, CapabilitiesRequest, CatalogContext, CatalogError, DetailLevel, DiscoverRequest,
    ExecuteRequest, InMemoryServerRegistry, RequestEnvelope, ServerRunState, StaticTokenValidator,
    ToolCatalogHandler, ToolCategory,
};
use toolhub_core::{Config, ServerConfig};
use toolhub_mcp::protocol::CallToolResult;
use toolhub_mcp::{InMemoryServer, McpToolDefinition, SessionManager, ToolBehavior, ToolContent};

const ADMIN: &str = "admin-token";
const FS_ONLY: &str = "fs-token";

struct Hub {
    handler: ToolCatalogHandler,
    manager: SessionManager,
    github: InMemoryServer,
    filesystem: InMemoryServer,
    slack: InMemoryServer,
}

fn text_result(text: &str) -> CallToolResult {
    CallToolResult {
        content: vec![ToolContent::text(text)],
        structured_content: None,
        is_error: false,
    }
}

fn github() -> InMemoryServer {
    let server = InMemoryServer::new("github");
    server.add_tool(
        McpToolDefinition::new("create_issue", "Open a new issue in a repository"),
        ToolBehavior::echo(),
    );
    server.add_tool(
        McpToolDefinition::new("list_pull_requests", "List open pull requests"),
        ToolBehavior::echo(),
    );
    server.add_tool(
        McpToolDefinition::new("search_code", "Search code across repositories")
            .with_output_schema(json!({"type": "object", "properties": {"matches": {"type": "array"}}}))
            .with_annotations(json!({"readOnlyHint": true})),
        ToolBehavior::echo(),
    );
    server.add_tool(
        McpToolDefinition::new("delete_repo", "Delete a repository"),
        ToolBehavior::echo(),
    );
    server.add_tool(
        McpToolDefinition::new("slow_report", "Build a long report"),
        ToolBehavior::progress(Duration::from_millis(800), 3, text_result("report ready")),
    );
    server.add_tool(
        McpToolDefinition::new("hang", "Never answers in time"),
        ToolBehavior::delayed(Duration::from_secs(30), ToolBehavior::echo()),
    );
    server
}

fn filesystem() -> InMemoryServer {
    let server = InMemoryServer::new("filesystem");
    server.add_tool(
        McpToolDefinition::new("read_file", "Read the contents of a file"),
        ToolBehavior::reply(CallToolResult {
            content: vec![
                ToolContent::text("see link"),
                ToolContent::ResourceLink {
                    uri: "file:///srv/notes.md".to_string(),
                    name: "notes.md".to_string(),
                    description: None,
                    mime_type: None,
                },
            ],
            structured_content: None,
            is_error: false,
        }),
    );
    server.add_tool(
        McpToolDefinition::new("delete_file", "Remove a file from disk"),
        ToolBehavior::echo(),
    );
    server
}

fn slack() -> InMemoryServer {
    let server = InMemoryServer::new("slack");
    server.add_tool(
        McpToolDefinition::new("post_message", "Send a message to a channel"),
        ToolBehavior::echo(),
    );
    server
}

async fn hub(scheme: &str) -> Hub {
    let mut config = Config::default();
    config.catalog.tool_key_scheme = scheme.to_string();
    hub_with(config).await
}

async fn hub_with(mut config: Config) -> Hub {
    config.catalog.call_timeout_secs = 1;
    config.catalog.ephemeral_ttl_secs = 60;

    let mut github_config = ServerConfig::stdio("srv-gh", "github", "unused").with_project("web");
    github_config.disabled_tools = vec!["delete_repo".to_string()];
    let servers = vec![
        (github_config, github()),
        (ServerConfig::stdio("srv-fs", "filesystem", "unused"), filesystem()),
        (ServerConfig::stdio("srv-slack", "slack", "unused").with_project("web"), slack()),
    ];

    let manager = SessionManager::new(&config);
    for (server_config, server) in &servers {
        let session = manager.register_with_factory(server_config, Arc::new(server.factory()));
        session.connect().await.unwrap();
    }

    let configs: Vec<ServerConfig> = servers.iter().map(|(c, _)| c.clone()).collect();
    let registry = InMemoryServerRegistry::from_configs(&configs);
    let tokens = StaticTokenValidator::new();
    tokens.grant_all(ADMIN, "admin");
    tokens.grant(FS_ONLY, "fs-agent", vec!["srv-fs".to_string()]);

    let context = CatalogContext::new(
        Arc::new(tokens),
        Arc::new(registry),
        manager.sessions(),
        manager.running_status(),
    );
    let handler = ToolCatalogHandler::from_config(context, &config.catalog).unwrap();

    let mut servers = servers.into_iter().map(|(_, s)| s);
    Hub {
        handler,
        manager,
        github: servers.next().unwrap(),
        filesystem: servers.next().unwrap(),
        slack: servers.next().unwrap(),
    }
}

fn admin() -> CallerContext {
    CallerContext::new(ADMIN)
}

async fn execute_err(hub: &Hub, caller: &CallerContext, key: &str) -> CatalogError {
    hub.handler
        .execute(caller, ExecuteRequest::new(key, Some(json!({}))))
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_discover_mints_semantic_keys() {
    let hub = hub("semantic").await;
    let response = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["create", "issue"]))
        .await
        .unwrap();

    assert_eq!(response.tools[0].tool_key, "github:create_issue");
    assert_eq!(response.tools[0].relevance, Some(1.0));
    assert_eq!(response.detail_level, DetailLevel::Summary);
    assert!(response.hint.is_none());
}

#[tokio::test]
async fn test_discover_detail_levels() {
    let hub = hub("semantic").await;

    let minimal = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["search", "code"]).with_detail(DetailLevel::Minimal))
        .await
        .unwrap();
    for tool in &minimal.tools {
        let json = serde_json::to_value(tool).unwrap();
        assert!(json.get("description").is_none());
    }

    let full = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["search", "code"]).with_detail(DetailLevel::Full))
        .await
        .unwrap();
    let search = full.tools.iter().find(|t| t.name == "search_code").unwrap();
    assert!(search.output_schema.is_some());
    assert_eq!(search.annotations, Some(json!({"readOnlyHint": true})));
    assert_eq!(search.description.as_deref(), Some("Search code across repositories"));
}

#[tokio::test]
async fn test_discover_respects_access_project_and_disabled_tools() {
    let hub = hub("semantic").await;

    let fs_only = hub
        .handler
        .discover(&CallerContext::new(FS_ONLY), DiscoverRequest::new(["delete"]))
        .await
        .unwrap();
    assert!(fs_only.tools.iter().all(|t| t.server == "filesystem"));
    assert!(fs_only.tools.iter().any(|t| t.name == "delete_file"));

    let admin_delete = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["delete"]))
        .await
        .unwrap();
    assert!(admin_delete.tools.iter().all(|t| t.name != "delete_repo"));

    let in_web = hub
        .handler
        .discover(&admin().with_project("web"), DiscoverRequest::new(["file"]))
        .await
        .unwrap();
    assert!(in_web.tools.iter().all(|t| t.server != "filesystem"));

    // "unassigned" means no project filter
    let unassigned = hub
        .handler
        .discover(&admin().with_project("unassigned"), DiscoverRequest::new(["file"]))
        .await
        .unwrap();
    assert!(unassigned.tools.iter().any(|t| t.server == "filesystem"));
}

#[tokio::test]
async fn test_discover_without_access_hints() {
    let hub = hub("semantic").await;
    let response = hub
        .handler
        .discover(&CallerContext::new(FS_ONLY).with_project("web"), DiscoverRequest::new(["issue"]))
        .await
        .unwrap();
    assert!(response.tools.is_empty());
    assert!(response.hint.is_some());
}

#[tokio::test]
async fn test_invalid_tokens_rejected_everywhere() {
    let hub = hub("semantic").await;
    let nobody = CallerContext::new("bogus");

    let err = hub
        .handler
        .discover(&nobody, DiscoverRequest::new(["issue"]))
        .await
        .unwrap_err();
    assert_eq!(err, CatalogError::InvalidToken);

    let err = hub
        .handler
        .capabilities(&CallerContext::default(), CapabilitiesRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err, CatalogError::InvalidToken);

    assert_eq!(execute_err(&hub, &nobody, "github:create_issue").await, CatalogError::InvalidToken);
}

#[tokio::test]
async fn test_execute_semantic_key_is_case_insensitive() {
    let hub = hub("semantic").await;

    for key in ["github:create_issue", "GitHub:create_issue", "GITHUB:create_issue"] {
        let response = hub
            .handler
            .execute(&admin(), ExecuteRequest::new(key, Some(json!({"title": "Bug"}))))
            .await
            .unwrap();
        assert!(!response.is_error);
        assert_eq!(response.content[0].as_text(), Some(r#"{"title":"Bug"}"#));
    }
    assert_eq!(hub.github.calls().len(), 3);
}

#[tokio::test]
async fn test_execute_validation_order() {
    let hub = hub("semantic").await;
    let fs_agent = CallerContext::new(FS_ONLY).with_project("elsewhere");

    // Unknown server comes first, even for a caller with little access
    let err = execute_err(&hub, &fs_agent, "zzz:anything").await;
    assert_eq!(err.code(), "SERVER_NOT_FOUND");

    // Access is checked before project and disabled-tool checks
    let err = execute_err(&hub, &fs_agent, "github:delete_repo").await;
    assert_eq!(err.code(), "ACCESS_DENIED");

    // Project before disabled tool
    let err = execute_err(&hub, &admin().with_project("mobile"), "github:delete_repo").await;
    assert_eq!(err.code(), "PROJECT_MISMATCH");

    let err = execute_err(&hub, &admin(), "github:delete_repo").await;
    assert_eq!(err.code(), "TOOL_DISABLED");

    let err = execute_err(&hub, &admin(), "no-separator").await;
    assert_eq!(err.code(), "MALFORMED_TOOL_KEY");

    assert!(hub.github.calls().is_empty());
}

#[tokio::test]
async fn test_execute_unavailable_servers_are_retriable() {
    let hub = hub("semantic").await;

    hub.handler.context().running.set("slack", false);
    let err = execute_err(&hub, &admin(), "slack:post_message").await;
    assert_eq!(err.code(), "SERVER_NOT_RUNNING");
    assert!(err.payload().retriable);

    hub.manager.stop_server("srv-fs").await;
    let err = execute_err(&hub, &admin(), "filesystem:read_file").await;
    assert_eq!(err.code(), "SERVER_NOT_CONNECTED");
    assert!(err.payload().retriable);
}

#[tokio::test]
async fn test_execute_unknown_tool_suggests_alternatives() {
    let hub = hub("semantic").await;
    let err = execute_err(&hub, &admin(), "github:create_issues").await;

    match err {
        CatalogError::ToolNotFound { ref suggestions, .. } => {
            assert_eq!(suggestions[0], "github:create_issue");
        }
        other => panic!("expected TOOL_NOT_FOUND, got {:?}", other),
    }
    assert_eq!(err.payload().suggested_tools[0], "github:create_issue");
}

#[tokio::test]
async fn test_execute_rewrites_resource_links() {
    let hub = hub("semantic").await;
    let response = hub
        .handler
        .execute(&admin(), ExecuteRequest::new("filesystem:read_file", None))
        .await
        .unwrap();

    assert!(matches!(
        &response.content[1],
        ToolContent::ResourceLink { uri, .. } if uri == "filesystem:file:///srv/notes.md"
    ));
    assert_eq!(hub.filesystem.calls()[0].0, "read_file");
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_resets_on_progress() {
    let hub = hub("semantic").await;

    // Three ticks 800ms apart outlast a 1s timeout only because each resets it
    let response = hub
        .handler
        .execute(&admin(), ExecuteRequest::new("github:slow_report", None))
        .await
        .unwrap();
    assert_eq!(response.content[0].as_text(), Some("report ready"));

    let err = execute_err(&hub, &admin(), "github:hang").await;
    assert_eq!(err.code(), "TOOL_TIMEOUT");
    assert!(err.is_retriable());
}

#[tokio::test(start_paused = true)]
async fn test_ephemeral_keys_expire() {
    let hub = hub("ephemeral").await;
    let response = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["post", "message"]))
        .await
        .unwrap();
    let key = response.tools[0].tool_key.clone();
    assert!(key.starts_with("tk_"));

    let ok = hub
        .handler
        .execute(&admin(), ExecuteRequest::new(&key, Some(json!({"text": "hi"}))))
        .await
        .unwrap();
    assert!(!ok.is_error);
    assert_eq!(hub.slack.calls().len(), 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(execute_err(&hub, &admin(), &key).await.code(), "TOOL_KEY_EXPIRED");
    assert_eq!(execute_err(&hub, &admin(), &key).await.code(), "TOOL_KEY_NOT_FOUND");

    // Semantic keys are malformed under the ephemeral scheme
    assert_eq!(
        execute_err(&hub, &admin(), "slack:post_message").await.code(),
        "MALFORMED_TOOL_KEY"
    );
}

#[tokio::test]
async fn test_migrating_scheme_accepts_semantic_keys() {
    let hub = hub("migrating").await;
    let response = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["read", "file"]))
        .await
        .unwrap();
    assert_eq!(response.tools[0].tool_key, "filesystem:read_file");

    let ok = hub
        .handler
        .execute(&admin(), ExecuteRequest::new("FileSystem:read_file", None))
        .await
        .unwrap();
    assert!(!ok.is_error);
}

#[tokio::test(start_paused = true)]
async fn test_migrating_scheme_can_mint_ephemeral_keys() {
    let mut config = Config::default();
    config.catalog.tool_key_scheme = "migrating".to_string();
    config.catalog.migrating_primary = "ephemeral".to_string();
    let hub = hub_with(config).await;

    let response = hub
        .handler
        .discover(&admin(), DiscoverRequest::new(["read", "file"]))
        .await
        .unwrap();
    let key = response.tools[0].tool_key.clone();
    assert!(key.starts_with("tk_"));

    // Minted keys resolve through the same table
    let ok = hub
        .handler
        .execute(&admin(), ExecuteRequest::new(&key, None))
        .await
        .unwrap();
    assert!(!ok.is_error);

    // Semantic keys keep working during the migration
    let ok = hub
        .handler
        .execute(&admin(), ExecuteRequest::new("filesystem:read_file", None))
        .await
        .unwrap();
    assert!(!ok.is_error);
    assert_eq!(hub.filesystem.calls().len(), 2);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(execute_err(&hub, &admin(), &key).await.code(), "TOOL_KEY_EXPIRED");
}

#[tokio::test(start_paused = true)]
async fn test_capabilities_not_held_up_by_call_in_flight() {
    let hub = hub("semantic").await;
    let start = tokio::time::Instant::now();

    let (call, listed_after) = tokio::join!(
        execute_err(&hub, &admin(), "github:hang"),
        async {
            tokio::task::yield_now().await;
            let response = hub
                .handler
                .capabilities(&admin(), CapabilitiesRequest::default())
                .await
                .unwrap();
            let github = response.servers.iter().find(|s| s.name == "github").unwrap();
            assert_eq!(github.status, ServerRunState::Running);
            assert_eq!(github.tool_count, 5);
            start.elapsed()
        }
    );

    // The listing answered while the call was still waiting
    assert!(listed_after < Duration::from_millis(100));
    assert_eq!(call.code(), "TOOL_TIMEOUT");
}

#[tokio::test]
async fn test_capabilities_summarizes_by_category() {
    let hub = hub("semantic").await;
    let response = hub
        .handler
        .capabilities(&admin(), CapabilitiesRequest::default())
        .await
        .unwrap();

    assert_eq!(response.total_servers, 3);
    assert_eq!(response.running_servers, 3);
    // delete_repo is disabled
    assert_eq!(response.total_tools, 5 + 2 + 1);

    assert_eq!(response.servers[0].name, "github");
    assert_eq!(response.servers[0].tool_count, 5);
    assert!(response
        .servers
        .windows(2)
        .all(|w| w[0].tool_count >= w[1].tool_count));

    assert_eq!(response.categories[0].category, ToolCategory::Development);
    assert_eq!(response.categories[0].count, 5);
    assert_eq!(response.categories[0].examples.len(), 3);
    assert!(response
        .categories
        .windows(2)
        .all(|w| w[0].count >= w[1].count));
}

#[tokio::test]
async fn test_capabilities_tolerates_a_failing_server() {
    let hub = hub("semantic").await;
    hub.slack.sever();

    let response = hub
        .handler
        .capabilities(&admin(), CapabilitiesRequest::default())
        .await
        .unwrap();

    assert_eq!(response.total_servers, 3);
    let slack = response.servers.iter().find(|s| s.name == "slack").unwrap();
    assert_eq!(slack.tool_count, 0);
    assert_eq!(slack.status, ServerRunState::Error);
    assert!(slack.error.is_some());

    let populated: Vec<_> = response
        .servers
        .iter()
        .filter(|s| s.status == ServerRunState::Running)
        .collect();
    assert_eq!(populated.len(), 2);
    assert!(populated.iter().all(|s| s.tool_count > 0));
}

#[tokio::test]
async fn test_capabilities_reports_stopped_servers() {
    let hub = hub("semantic").await;
    hub.manager.stop_server("srv-slack").await;

    let response = hub
        .handler
        .capabilities(&admin(), CapabilitiesRequest::default())
        .await
        .unwrap();
    let slack = response.servers.iter().find(|s| s.name == "slack").unwrap();
    assert_eq!(slack.status, ServerRunState::Stopped);
    assert_eq!(slack.tool_count, 0);
}

#[tokio::test]
async fn test_capabilities_filters() {
    let hub = hub("semantic").await;

    let one = hub
        .handler
        .capabilities(
            &admin(),
            CapabilitiesRequest {
                server: Some("FILESYSTEM".to_string()),
                category: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(one.servers.len(), 1);
    assert_eq!(one.total_tools, 2);

    let comms = hub
        .handler
        .capabilities(
            &admin(),
            CapabilitiesRequest {
                server: None,
                category: Some("communication".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(comms.total_tools, 1);
    assert_eq!(comms.categories.len(), 1);

    let err = hub
        .handler
        .capabilities(
            &CallerContext::new(FS_ONLY),
            CapabilitiesRequest {
                server: Some("github".to_string()),
                category: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ACCESS_DENIED");

    let err = hub
        .handler
        .capabilities(
            &admin(),
            CapabilitiesRequest {
                server: Some("zzz".to_string()),
                category: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SERVER_NOT_FOUND");
}

#[tokio::test]
async fn test_handle_renders_envelopes() {
    let hub = hub("semantic").await;

    let envelope = RequestEnvelope::parse(
        &json!({
            "operation": "discover",
            "token": ADMIN,
            "query": "pull requests",
            "detailLevel": "minimal"
        })
        .to_string(),
    )
    .unwrap();
    let response = hub.handler.handle(envelope).await;
    assert!(!response.is_error);
    let structured = response.structured_content.unwrap();
    assert_eq!(structured["tools"][0]["toolKey"], "github:list_pull_requests");

    let envelope = RequestEnvelope::parse(
        &json!({"operation": "execute", "token": ADMIN, "toolKey": "zzz:x"}).to_string(),
    )
    .unwrap();
    let response = hub.handler.handle(envelope).await;
    assert!(response.is_error);
    assert_eq!(response.error_type(), Some("SERVER_NOT_FOUND"));
    let text = response.content[0].as_text().unwrap();
    assert!(text.contains("Action:"));
    assert_eq!(
        response.structured_content.as_ref().map(|v| v["recoverySteps"].is_array()),
        Some(true)
    );

    let envelope = RequestEnvelope::parse(
        &json!({"operation": "discover", "token": ADMIN, "query": []}).to_string(),
    )
    .unwrap();
    let response = hub.handler.handle(envelope).await;
    assert_eq!(response.error_type(), Some("INVALID_REQUEST"));
    let _: Value = serde_json::to_value(&response).unwrap();
}
