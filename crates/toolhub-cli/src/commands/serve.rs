//! Line-delimited JSON front end.
//!
//! Each stdin line is one request envelope; each answer is one line of
//! response JSON on stdout, in request order.

use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use toolhub_catalog::{CallerContext, RequestEnvelope, ToolResponse};
use tracing::{debug, info};

use crate::hub::Hub;

pub async fn run(hub: &Hub, defaults: &CallerContext) -> anyhow::Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    info!("Serving catalog requests on stdin");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match RequestEnvelope::parse(&line) {
            Ok(envelope) => hub.handler.handle(with_defaults(envelope, defaults)).await,
            Err(e) => ToolResponse::error(&e),
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    Ok(ExitCode::SUCCESS)
}

/// Fill the token and project from the command line when a request omits them.
fn with_defaults(mut envelope: RequestEnvelope, defaults: &CallerContext) -> RequestEnvelope {
    if envelope.caller.token.is_none() {
        envelope.caller.token = defaults.token.clone();
    }
    if envelope.caller.project.is_none() {
        envelope.caller.project = defaults.project.clone();
    }
    envelope
}
