//! Integration tests for mcpgate
//!
//! Each test wires a real `BridgeServer` from library types on a dedicated
//! localhost port and drives it over a raw TCP stream, with small shell
//! one-liners standing in for the MCP stdio server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mcpgate::auth::CredentialRegistry;
use mcpgate::config::UpstreamConfig;
use mcpgate::limiter::RateLimiter;
use mcpgate::registry::ConnectionRegistry;
use mcpgate::server::{BridgeContext, BridgeServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// One running bridge under test
struct TestBridge {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

/// A shell one-liner that reads the first input line, echoes it back, then
/// emits a fixed trailer and exits
const ECHO_SCRIPT: &str = "read line; echo \"$line\"; echo done";

async fn start_bridge(
    port: u16,
    script: &str,
    identities: &[(&str, &str)],
    limiter: RateLimiter,
) -> TestBridge {
    start_bridge_with_command(port, "sh", &["-c", script], identities, limiter).await
}

async fn start_bridge_with_command(
    port: u16,
    command: &str,
    args: &[&str],
    identities: &[(&str, &str)],
    limiter: RateLimiter,
) -> TestBridge {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(ConnectionRegistry::new());

    let identities: HashMap<String, String> = identities
        .iter()
        .map(|(name, token)| (name.to_string(), token.to_string()))
        .collect();

    let context = Arc::new(BridgeContext {
        upstream: UpstreamConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            shutdown_grace_period_secs: 1,
        },
        credentials: CredentialRegistry::new(&identities),
        limiter,
        registry: Arc::clone(&registry),
        shutdown_rx,
    });

    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let server = BridgeServer::new(addr, context);
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    assert!(
        wait_for_port(port, Duration::from_secs(5)).await,
        "bridge did not start listening on port {}",
        port
    );

    TestBridge {
        registry,
        shutdown_tx,
    }
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a simple HTTP GET and read the whole response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response)).await??;
    Ok(response)
}

/// POST to the SSE endpoint with optional extra headers, reading until the
/// server closes the channel
async fn http_post_sse(
    port: u16,
    body: &str,
    headers: &[(&str, &str)],
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "POST /mcp/v1/sse HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: {}\r\nConnection: close\r\n",
        port,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response)).await??;
    Ok(response)
}

#[tokio::test]
async fn test_root_info_endpoint() {
    let bridge = start_bridge(18101, ECHO_SCRIPT, &[], RateLimiter::default()).await;

    let response = http_get(18101, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"name\":\"mcpgate\""));
    assert!(response.contains("\"protocol\":\"sse\""));
    assert!(response.contains("\"endpoint\":\"/mcp/v1/sse\""));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_health_endpoint() {
    let bridge = start_bridge(18102, ECHO_SCRIPT, &[], RateLimiter::default()).await;

    let response = http_get(18102, "/health").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"healthy\""));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let bridge = start_bridge(18103, ECHO_SCRIPT, &[], RateLimiter::default()).await;

    let response = http_get(18103, "/nope").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("X-Bridge-Error: NOT_FOUND") || response.contains("x-bridge-error: NOT_FOUND"));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_sse_roundtrip_no_auth() {
    let bridge = start_bridge(18104, ECHO_SCRIPT, &[], RateLimiter::default()).await;

    let body = r#"{"id":1,"method":"ping"}"#;
    let response = http_post_sse(18104, body, &[]).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(
        response.contains("text/event-stream"),
        "missing SSE content type: {}",
        response
    );

    // The subprocess received the body as its first input line and echoed
    // it; events arrive in production order, one per line
    let echo_pos = response
        .find("data: {\"id\":1,\"method\":\"ping\"}")
        .expect("echoed payload event");
    let done_pos = response.find("data: done").expect("trailer event");
    assert!(echo_pos < done_pos);

    // The channel closed on subprocess exit and the session cleaned up
    assert!(bridge.registry.drained(Duration::from_secs(5)).await);

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_ordered_multi_line_relay() {
    let bridge = start_bridge(
        18105,
        "echo alpha; echo beta; echo gamma",
        &[],
        RateLimiter::default(),
    )
    .await;

    let response = http_post_sse(18105, "", &[]).await.unwrap();

    let alpha = response.find("data: alpha").expect("alpha event");
    let beta = response.find("data: beta").expect("beta event");
    let gamma = response.find("data: gamma").expect("gamma event");
    assert!(alpha < beta && beta < gamma);

    // No duplicates
    assert_eq!(response.matches("data: alpha").count(), 1);
    assert_eq!(response.matches("data: beta").count(), 1);
    assert_eq!(response.matches("data: gamma").count(), 1);

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_wrong_bearer_rejected_without_spawn() {
    let bridge = start_bridge(
        18106,
        ECHO_SCRIPT,
        &[("admin", "right-token")],
        RateLimiter::default(),
    )
    .await;

    let response = http_post_sse(
        18106,
        r#"{"id":1,"method":"ping"}"#,
        &[("Authorization", "Bearer wrong")],
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 401"));
    assert!(response.contains("UNAUTHORIZED"));
    // No subprocess was spawned, so nothing was ever registered
    assert!(bridge.registry.is_empty());

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_valid_bearer_accepted() {
    let bridge = start_bridge(
        18107,
        ECHO_SCRIPT,
        &[("admin", "right-token")],
        RateLimiter::default(),
    )
    .await;

    let response = http_post_sse(
        18107,
        r#"{"id":2,"method":"ping"}"#,
        &[("Authorization", "Bearer right-token")],
    )
    .await
    .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("data: {\"id\":2,\"method\":\"ping\"}"));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_api_key_header_accepted() {
    let bridge = start_bridge(
        18108,
        ECHO_SCRIPT,
        &[("ci", "key-token")],
        RateLimiter::default(),
    )
    .await;

    let response = http_post_sse(18108, "{}", &[("X-API-Key", "key-token")])
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_rate_limit_rejects_over_quota() {
    // Tight injected quota; the production constants are covered by the
    // limiter's unit tests
    let bridge = start_bridge(
        18109,
        "true",
        &[],
        RateLimiter::new(Duration::from_secs(60), 2),
    )
    .await;

    for _ in 0..2 {
        let response = http_post_sse(18109, "", &[]).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    }

    let response = http_post_sse(18109, "", &[]).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 429"));
    assert!(response.contains("RATE_LIMITED"));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_rate_limit_sources_independent() {
    let bridge = start_bridge(
        18110,
        "true",
        &[],
        RateLimiter::new(Duration::from_secs(60), 1),
    )
    .await;

    let first = http_post_sse(18110, "", &[("X-Forwarded-For", "203.0.113.1")])
        .await
        .unwrap();
    assert!(first.starts_with("HTTP/1.1 200"));

    let again = http_post_sse(18110, "", &[("X-Forwarded-For", "203.0.113.1")])
        .await
        .unwrap();
    assert!(again.starts_with("HTTP/1.1 429"));

    // A different source still has its own quota
    let other = http_post_sse(18110, "", &[("X-Forwarded-For", "203.0.113.2")])
        .await
        .unwrap();
    assert!(other.starts_with("HTTP/1.1 200"));

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_spawn_failure_is_clean_request_failure() {
    let bridge = start_bridge_with_command(
        18111,
        "definitely-not-a-real-binary-d41d",
        &[],
        &[],
        RateLimiter::default(),
    )
    .await;

    let response = http_post_sse(18111, "{}", &[]).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.contains("UPSTREAM_SPAWN_FAILED"));
    // Spawn failure must not leave a dangling registry entry
    assert!(bridge.registry.is_empty());

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_client_disconnect_terminates_subprocess() {
    // Upstream never writes, never exits; only the client going away can
    // end this session
    let bridge = start_bridge(18112, "sleep 60", &[], RateLimiter::default()).await;

    {
        let mut stream = TcpStream::connect("127.0.0.1:18112").await.unwrap();
        let request =
            "POST /mcp/v1/sse HTTP/1.1\r\nHost: 127.0.0.1:18112\r\nContent-Length: 4\r\n\r\nping";
        stream.write_all(request.as_bytes()).await.unwrap();

        // Wait until the session is live, then drop the connection
        let start = std::time::Instant::now();
        while bridge.registry.is_empty() && start.elapsed() < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(bridge.registry.len(), 1);
    }

    // Cleanup must observe the disconnect, terminate the subprocess, and
    // drop the registry entry
    assert!(bridge.registry.drained(Duration::from_secs(10)).await);

    let _ = bridge.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_shutdown_drains_active_sessions() {
    let bridge = start_bridge(18113, "sleep 60", &[], RateLimiter::default()).await;

    let mut stream = TcpStream::connect("127.0.0.1:18113").await.unwrap();
    let request =
        "POST /mcp/v1/sse HTTP/1.1\r\nHost: 127.0.0.1:18113\r\nContent-Length: 0\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let start = std::time::Instant::now();
    while bridge.registry.is_empty() && start.elapsed() < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(bridge.registry.len(), 1);

    // Process-wide shutdown unwinds the streaming loop into cleanup
    let _ = bridge.shutdown_tx.send(true);
    assert!(bridge.registry.drained(Duration::from_secs(10)).await);
}
