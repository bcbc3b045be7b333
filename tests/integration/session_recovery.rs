//! End-to-end session recovery scenarios.
//!
//! A client that reconnects with its minted token inside the recovery TTL
//! gets its previous connection back, user data included; past the TTL the
//! server downgrades to a fresh session and says why.

use futures_util::FutureExt;
use helios_protocol::Frame;
use helios_test_utils::MockWsClient;
use serde_json::json;
use server::{
    HandlerCtx, HealthConfig, Server, ServerConfig, ServerEvent, SessionRecoveryConfig,
};
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "integration-secret-0123456789abcdef";

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
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, format!("ws://{addr}/ws"))
}

fn recovery_config(ttl: Duration) -> ServerConfig {
    ServerConfig {
        session_recovery: SessionRecoveryConfig {
            enabled: true,
            secret: Some(SECRET.to_owned()),
            ttl,
            sweep_interval: Duration::from_millis(50),
        },
        health_check: HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn wait_for_session_id(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
) -> String {
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(ServerEvent::SessionCreated { session_id, .. })) => return session_id,
            Ok(Ok(_)) => continue,
            other => panic!("no session-created event: {other:?}"),
        }
    }
}

/// Issue one RPC and return the response payload.
async fn call(
    client: &mut MockWsClient,
    method: &str,
    payload: serde_json::Value,
) -> serde_json::Value {
    let request = Frame::request(method, payload);
    let request_id = request.id().to_owned();
    client.send_frame(&request).await.expect("send request");
    client
        .recv_response(&request_id)
        .await
        .expect("receive response")
        .payload
}

// ---------------------------------------------------------------------------
// Scenario: recovery inside the TTL
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_within_ttl_restores_user_data() {
    let (server, url) = start_server(recovery_config(Duration::from_secs(10))).await;
    server
        .methods()
        .register("profile.set", |ctx: HandlerCtx| {
            async move {
                let value = ctx.payload.get("value").cloned().unwrap_or(json!(null));
                ctx.connection.set_user_data("k", value).await;
                Ok(json!({ "ok": true }))
            }
            .boxed()
        })
        .await;
    server
        .methods()
        .register("profile.get", |ctx: HandlerCtx| {
            async move { Ok(json!({ "value": ctx.connection.user_data("k").await })) }.boxed()
        })
        .await;
    let mut events = server.events();

    let mut client = MockWsClient::connect(&url).await.expect("connect");
    let created = client
        .recv_event("session:created")
        .await
        .expect("session:created");
    let token = created.payload["token"].as_str().expect("token").to_owned();
    assert_eq!(created.payload["ttl"], 10_000);
    let session_id = wait_for_session_id(&mut events).await;

    assert_eq!(call(&mut client, "profile.set", json!({"value": "v"})).await["ok"], true);
    client.close().await.expect("close");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut revived = MockWsClient::connect_with_token(&url, &token)
        .await
        .expect("reconnect");
    let recovered = revived
        .recv_event("session:recovered")
        .await
        .expect("session:recovered");
    assert_eq!(recovered.payload["sessionId"], json!(session_id));

    // The reconnected transport sees the same connection state.
    assert_eq!(
        call(&mut revived, "profile.get", json!({})).await["value"],
        "v"
    );
}

// ---------------------------------------------------------------------------
// Scenario: recovery after expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_after_ttl_downgrades_with_a_reason() {
    let (_server, url) = start_server(recovery_config(Duration::from_millis(100))).await;

    let mut client = MockWsClient::connect(&url).await.expect("connect");
    let token = client
        .recv_event("session:created")
        .await
        .expect("session:created")
        .payload["token"]
        .as_str()
        .expect("token")
        .to_owned();
    client.close().await.expect("close");

    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut revived = MockWsClient::connect_with_token(&url, &token)
        .await
        .expect("reconnect");
    let failed = revived
        .recv_event("session:recovery-failed")
        .await
        .expect("session:recovery-failed");
    let reason = failed.payload["reason"].as_str().expect("reason");
    assert!(reason.contains("expired"), "unexpected reason: {reason}");

    // A fresh session follows the failure.
    revived
        .recv_event("session:created")
        .await
        .expect("fresh session:created");
}

// ---------------------------------------------------------------------------
// Scenario: token refresh over RPC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_is_rate_limited_until_half_ttl() {
    let (_server, url) = start_server(recovery_config(Duration::from_millis(200))).await;

    let mut client = MockWsClient::connect(&url).await.expect("connect");
    client
        .recv_event("session:created")
        .await
        .expect("session:created");

    // Immediately after creation: rate limited.
    let limited = call(&mut client, "session.refresh", json!({})).await;
    assert_eq!(limited["error"], "Rate limit exceeded");
    assert!(limited["waitMs"].as_u64().is_some());

    // Past ttl/2: a new token for the same session.  The wire event goes
    // out before the response, so read it first.
    tokio::time::sleep(Duration::from_millis(120)).await;
    let request = Frame::request("session.refresh", json!({}));
    let request_id = request.id().to_owned();
    client.send_frame(&request).await.expect("send refresh");
    let refreshed_event = client
        .recv_event("session:refreshed")
        .await
        .expect("session:refreshed");
    assert!(refreshed_event.payload["token"].as_str().is_some());
    let response = client
        .recv_response(&request_id)
        .await
        .expect("refresh response");
    assert_eq!(response.payload["success"], true);
    assert!(response.payload["token"].as_str().is_some());
}
