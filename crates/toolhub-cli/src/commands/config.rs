//! Configuration management commands.

use std::process::ExitCode;

use toolhub_core::config::TransportConfig;
use toolhub_core::Config;

use crate::ConfigAction;

const REDACTED: &str = "********";

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<ExitCode> {
    match action {
        ConfigAction::Show => {
            println!("# Config directory: {}", Config::config_dir().display());
            println!("{}", toml::to_string_pretty(&redacted(config))?);
            Ok(ExitCode::SUCCESS)
        }
        ConfigAction::Validate => {
            let result = config.validate();
            for issue in result.errors() {
                println!("  ✗ {}: {}", issue.field, issue.message);
            }
            for issue in result.warnings() {
                println!("  ! {}: {}", issue.field, issue.message);
            }
            if result.is_ok() {
                println!(
                    "Configuration is valid ({} servers, {} tokens)",
                    config.servers.len(),
                    config.tokens.len()
                );
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Configuration has {} error(s)", result.errors().len());
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// A copy of `config` with literal tokens and child environment values masked.
fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    for grant in &mut config.tokens {
        if grant.token.is_some() {
            grant.token = Some(REDACTED.to_string());
        }
    }
    for server in &mut config.servers {
        if let TransportConfig::Stdio { env, .. } = &mut server.transport {
            for value in env.values_mut() {
                *value = REDACTED.to_string();
            }
        }
    }
    config
}
