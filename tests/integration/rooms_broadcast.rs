//! End-to-end room subscription and broadcast scenarios.

use futures_util::FutureExt;
use helios_protocol::Frame;
use helios_test_utils::MockWsClient;
use serde_json::json;
use server::{
    HandlerCtx, HealthConfig, RoomKind, Server, ServerConfig, Validator, ValidatorCtx,
};
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
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, format!("ws://{addr}/ws"))
}

fn quiet_config() -> ServerConfig {
    ServerConfig {
        health_check: HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        },
        ..ServerConfig::default()
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

/// `user:<id>` is granted only when the connection authenticated as that id.
fn user_room_validator() -> Validator {
    Arc::new(|ctx: ValidatorCtx| {
        async move {
            let user_id = ctx.connection.user_data("userId").await;
            Ok(user_id.as_ref().and_then(|v| v.as_str())
                == ctx.captures.first().map(String::as_str))
        }
        .boxed()
    })
}

async fn register_login(server: &Arc<Server>) {
    server
        .methods()
        .register("auth.login", |ctx: HandlerCtx| {
            async move {
                let user_id = ctx.payload.get("userId").cloned().unwrap_or(json!(null));
                ctx.connection.set_user_data("userId", user_id).await;
                Ok(json!({ "ok": true }))
            }
            .boxed()
        })
        .await;
}

// ---------------------------------------------------------------------------
// Scenario: validator-gated room with pattern broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_reaches_only_validated_subscribers() {
    let (server, url) = start_server(quiet_config()).await;
    register_login(&server).await;
    server
        .broker()
        .declare("user:*", RoomKind::Protected, Some(user_room_validator()))
        .await
        .expect("declare user room");

    let mut x = MockWsClient::connect(&url).await.expect("connect x");
    let mut y = MockWsClient::connect(&url).await.expect("connect y");
    assert_eq!(call(&mut x, "auth.login", json!({"userId": "123"})).await["ok"], true);
    assert_eq!(call(&mut y, "auth.login", json!({"userId": "456"})).await["ok"], true);

    let granted = call(&mut x, "helios.subscribe", json!({"topic": "user:123"})).await;
    assert_eq!(granted["ok"], true);

    let denied = call(&mut y, "helios.subscribe", json!({"topic": "user:123"})).await;
    assert_eq!(denied["ok"], false);
    assert_eq!(denied["error"], "Permission denied");

    // Pattern broadcast: one target, one delivery.
    let report = server.broadcast("user:*", &json!({"hi": 1})).await;
    assert_eq!(report.targets, 1);
    assert_eq!(report.sent, 1);

    // The delivered event carries the pattern verbatim as its topic.
    let event = x.recv_event("user:*").await.expect("broadcast event");
    assert_eq!(event.payload, json!({"hi": 1}));

    // The denied connection sees nothing.
    let nothing = tokio::time::timeout(Duration::from_millis(100), y.recv_frame()).await;
    assert!(nothing.is_err(), "y unexpectedly received {nothing:?}");
}

// ---------------------------------------------------------------------------
// Scenario: deny-by-default and unsubscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn undeclared_rooms_reject_and_unsubscribe_stops_delivery() {
    let (server, url) = start_server(quiet_config()).await;
    server
        .broker()
        .declare("chat:lobby", RoomKind::Public, None)
        .await
        .expect("declare lobby");

    let mut client = MockWsClient::connect(&url).await.expect("connect");

    let rejected = call(&mut client, "helios.subscribe", json!({"topic": "nowhere"})).await;
    assert_eq!(rejected["ok"], false);
    assert_eq!(rejected["error"], "Room not declared (deny by default)");

    assert_eq!(
        call(&mut client, "helios.subscribe", json!({"topic": "chat:lobby"})).await["ok"],
        true
    );
    let report = server.broadcast("chat:lobby", &json!({"n": 1})).await;
    assert_eq!((report.targets, report.sent), (1, 1));
    client.recv_event("chat:lobby").await.expect("delivery");

    assert_eq!(
        call(&mut client, "helios.unsubscribe", json!({"topic": "chat:lobby"})).await["ok"],
        true
    );
    let report = server.broadcast("chat:lobby", &json!({"n": 2})).await;
    assert_eq!((report.targets, report.sent), (0, 0));

    // Unsubscribing again reports nothing removed.
    assert_eq!(
        call(&mut client, "helios.unsubscribe", json!({"topic": "chat:lobby"})).await["ok"],
        false
    );
}
