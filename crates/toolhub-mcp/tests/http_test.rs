//! Streamable HTTP sessions against a local endpoint.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use toolhub_mcp::transport::{HttpTransportFactory, TransportFactory};
use toolhub_mcp::{McpConnection, McpError};

/// Gap between events on a tools/call stream.
const GAP: Duration = Duration::from_millis(300);
const TICKS: u32 = 4;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(stream: &mut TcpStream) -> Option<Value> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let body_start = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
    let length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < body_start + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    serde_json::from_slice(&buf[body_start..body_start + length]).ok()
}

async fn write_json(stream: &mut TcpStream, body: &Value) {
    let body = body.to_string();
    let head = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nmcp-session-id: s-1\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
}

/// `report` streams a progress event every `GAP` before its result;
/// `silent` takes just as long but says nothing until the result.
async fn handle(mut stream: TcpStream) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let id = request["id"].clone();

    match request["method"].as_str().unwrap_or_default() {
        "initialize" => {
            let reply = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "http-endpoint", "version": "0.0.0" },
                },
            });
            write_json(&mut stream, &reply).await;
        }
        "tools/call" => {
            let tool = request["params"]["name"].as_str().unwrap_or_default().to_string();
            let token = request["params"]["_meta"]["progressToken"].clone();

            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n";
            if stream.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let _ = stream.flush().await;

            for tick in 1..=TICKS {
                tokio::time::sleep(GAP).await;
                if tool == "report" {
                    let event = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/progress",
                        "params": { "progressToken": token, "progress": tick, "total": TICKS },
                    });
                    let frame = format!("event: message\ndata: {}\n\n", event);
                    if stream.write_all(frame.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            }

            let result = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{ "type": "text", "text": "done" }], "isError": false },
            });
            let frame = format!("event: message\ndata: {}\n\n", result);
            let _ = stream.write_all(frame.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        _ => {
            let _ = stream
                .write_all(b"HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        }
    }
}

async fn start_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle(stream));
        }
    });
    format!("http://{}/mcp", addr)
}

async fn connect(url: String) -> McpConnection {
    let transport = HttpTransportFactory::new(url, None).create().await.unwrap();
    let connection = McpConnection::new("http", transport).with_request_timeout(Duration::from_secs(5));
    connection.initialize().await.unwrap();
    connection
}

#[tokio::test]
async fn test_streamed_progress_keeps_long_call_alive() {
    let connection = connect(start_endpoint().await).await;
    assert_eq!(connection.server_info().unwrap().name, "http-endpoint");

    // 1.2s of streaming, never 500ms without an event
    let result = connection
        .call_tool("report", None, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(result.content[0].as_text(), Some("done"));

    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_quiet_stream_times_out() {
    let connection = connect(start_endpoint().await).await;

    let err = connection
        .call_tool("silent", None, Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout(_)));

    connection.close().await.unwrap();
}
