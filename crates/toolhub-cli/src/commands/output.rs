//! Rendering catalog responses on stdout.

use std::process::ExitCode;

use toolhub_catalog::ToolResponse;
use toolhub_mcp::ToolContent;

/// Print `response` and map its error flag onto the exit code.
pub fn print_response(response: &ToolResponse, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        for item in &response.content {
            println!("{}", render_content(item));
        }
    }

    Ok(if response.is_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn render_content(item: &ToolContent) -> String {
    match item {
        ToolContent::Text { text } => text.clone(),
        ToolContent::Image { mime_type, data } => format!("[image {} ({} bytes base64)]", mime_type, data.len()),
        ToolContent::Audio { mime_type, data } => format!("[audio {} ({} bytes base64)]", mime_type, data.len()),
        ToolContent::ResourceLink { uri, name, .. } => format!("[resource {}: {}]", name, uri),
        ToolContent::Resource { resource } => match &resource.text {
            Some(text) => text.clone(),
            None => format!("[resource {}]", resource.uri),
        },
    }
}
