//! End-to-end health-check scenarios.
//!
//! The server runs in-process on an ephemeral port; clients connect through
//! a real WebSocket.  A client that polls its stream answers server pings
//! automatically (tungstenite replies on read); a client that never reads
//! behaves like a dead peer.

use helios_test_utils::MockWsClient;
use server::{Connection, ConnectionState, HealthConfig, Server, ServerConfig, ServerEvent};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_server(config: ServerConfig) -> (Arc<Server>, String) {
    let server = Server::new(config).await.expect("server construction");
    let router = server::build_router(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, format!("ws://{addr}/ws"))
}

fn fast_health_config() -> ServerConfig {
    ServerConfig {
        health_check: HealthConfig {
            enabled: true,
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(30),
            max_missed: 2,
        },
        ..ServerConfig::default()
    }
}

async fn wait_for_connection(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
) -> Arc<Connection> {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(ServerEvent::ConnectionOpened { connection })) => return connection,
            Ok(Ok(_)) => continue,
            other => panic!("no connection event: {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenario: responsive peer
// ---------------------------------------------------------------------------

/// With `{interval: 50ms, timeout: 30ms, max_missed: 2}` and a client that
/// answers every ping, 180ms later the connection is still OPEN, no pong
/// was missed, and at least one pong round trip was observed.
#[tokio::test]
async fn responsive_peer_stays_open_with_zero_misses() {
    let (server, url) = start_server(fast_health_config()).await;
    let mut events = server.events();

    let mut client = MockWsClient::connect(&url).await.expect("connect");
    let conn = wait_for_connection(&mut events).await;

    // Keep polling so the client library answers pings as they arrive.
    let reader = tokio::spawn(async move { while client.recv_frame().await.is_ok() {} });

    tokio::time::sleep(Duration::from_millis(180)).await;
    assert_eq!(conn.state().await, ConnectionState::Open);

    let mut pongs = 0;
    let mut misses = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ServerEvent::PongReceived { .. } => pongs += 1,
            ServerEvent::PingMissed { .. } => misses += 1,
            _ => {}
        }
    }
    assert!(pongs >= 1, "expected at least one pong round trip");
    assert_eq!(misses, 0);
    reader.abort();
}

// ---------------------------------------------------------------------------
// Scenario: dead peer
// ---------------------------------------------------------------------------

/// A client that never reads never pongs: misses accumulate to the limit
/// and the server terminates the transport with 1000 / "Ping timeout".
#[tokio::test]
async fn silent_peer_is_terminated_with_ping_timeout() {
    let (server, url) = start_server(fast_health_config()).await;
    let mut events = server.events();

    // Keep the client alive but never poll its stream.
    let _client = MockWsClient::connect(&url).await.expect("connect");
    wait_for_connection(&mut events).await;

    let mut missed = Vec::new();
    let mut timeout_seen = false;
    let (code, reason) = loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(ServerEvent::PingMissed { missed_pongs, .. })) => missed.push(missed_pongs),
            Ok(Ok(ServerEvent::PingTimeout { .. })) => timeout_seen = true,
            Ok(Ok(ServerEvent::Disconnection { code, reason, .. })) => break (code, reason),
            Ok(Ok(_)) => continue,
            other => panic!("health events stopped: {other:?}"),
        }
    };

    assert_eq!(missed, vec![1, 2]);
    assert!(timeout_seen);
    assert_eq!(code, 1000);
    assert_eq!(reason, "Ping timeout");
}
