//! Diagnostic command to check configuration and server reachability.

use std::process::ExitCode;

use toolhub_core::Config;
use toolhub_mcp::{ServerStatus, SessionManager};

pub async fn run(config: &Config) -> anyhow::Result<ExitCode> {
    println!("Running diagnostics...\n");
    let mut healthy = true;

    // Check config directory
    let config_dir = Config::config_dir();
    println!("Config directory: {:?}", config_dir);
    if config_dir.exists() {
        println!("  ✓ Exists");
    } else {
        println!("  ✗ Does not exist (defaults and environment only)");
    }

    // Check configuration
    println!("\nConfiguration:");
    let validation = config.validate();
    for issue in validation.errors() {
        println!("  ✗ {}: {}", issue.field, issue.message);
    }
    for issue in validation.warnings() {
        println!("  ! {}: {}", issue.field, issue.message);
    }
    if validation.is_ok() {
        println!("  ✓ Valid");
    } else {
        healthy = false;
    }

    // Check tokens
    println!("\nTokens:");
    if config.tokens.is_empty() {
        println!("  ✗ No tokens configured; every request will be rejected");
        healthy = false;
    }
    for grant in &config.tokens {
        let scope = if grant.grants_all() {
            "all servers".to_string()
        } else {
            grant.servers.join(", ")
        };
        match grant.resolve_token() {
            Some(_) => println!("  ✓ {} ({})", grant.client_id, scope),
            None => println!("  ✗ {} has no usable token", grant.client_id),
        }
    }

    // Check servers
    println!("\nServers:");
    if config.servers.is_empty() {
        println!("  ✗ No servers configured");
        return Ok(verdict(false));
    }

    let manager = SessionManager::new(config);
    let report = manager.start_all(&config.servers).await;

    for server in &config.servers {
        if report.skipped.contains(&server.id) {
            println!("  - {} ({}): disabled", server.name, server.id);
            continue;
        }
        if let Some(session) = manager.sessions().get(&server.id) {
            if report.started.contains(&server.id) {
                if let Err(e) = session.list_tools().await {
                    println!("  ✗ {} ({}): tool listing failed: {}", server.name, server.id, e);
                    healthy = false;
                    continue;
                }
            }
        }
        let status = manager.server_status(&server.id);
        let mark = match &status {
            ServerStatus::Session { tool_count: Some(_), .. } => "✓",
            _ => {
                healthy = false;
                "✗"
            }
        };
        println!("  {} {} ({}): {}", mark, server.name, server.id, status);
    }

    manager.stop_all().await;
    Ok(verdict(healthy))
}

fn verdict(healthy: bool) -> ExitCode {
    if healthy {
        println!("\nAll checks passed.");
        ExitCode::SUCCESS
    } else {
        println!("\nSome checks failed.");
        ExitCode::FAILURE
    }
}
