//! One-shot `discover`, `execute` and `capabilities` commands.

use std::process::ExitCode;

use serde_json::Value;
use toolhub_catalog::{
    CallerContext, CapabilitiesRequest, CatalogRequest, DetailLevel, DiscoverRequest,
    ExecuteRequest, RequestEnvelope,
};

use super::output::print_response;
use crate::hub::Hub;

#[allow(clippy::too_many_arguments)]
pub async fn discover(
    hub: &Hub,
    caller: &CallerContext,
    keywords: Vec<String>,
    context: Option<String>,
    max_results: Option<usize>,
    detail: Option<DetailLevel>,
    category: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let request = DiscoverRequest {
        query: split_keywords(&keywords),
        context,
        max_results,
        detail_level: detail,
        category,
    };
    run(hub, caller, CatalogRequest::Discover(request), json).await
}

pub async fn execute(
    hub: &Hub,
    caller: &CallerContext,
    tool_key: String,
    args: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let arguments = args.as_deref().map(parse_arguments).transpose()?;
    let request = ExecuteRequest::new(tool_key, arguments);
    run(hub, caller, CatalogRequest::Execute(request), json).await
}

pub async fn capabilities(
    hub: &Hub,
    caller: &CallerContext,
    server: Option<String>,
    category: Option<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let request = CapabilitiesRequest { server, category };
    run(hub, caller, CatalogRequest::Capabilities(request), json).await
}

async fn run(
    hub: &Hub,
    caller: &CallerContext,
    request: CatalogRequest,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let response = hub
        .handler
        .handle(RequestEnvelope::new(caller.clone(), request))
        .await;
    print_response(&response, json)
}

/// Shell arguments may each hold several words.
fn split_keywords(keywords: &[String]) -> Vec<String> {
    keywords
        .iter()
        .flat_map(|k| k.split_whitespace())
        .map(str::to_string)
        .collect()
}

fn parse_arguments(raw: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("--args is not valid JSON: {}", e))?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(value)
}
