//! End-to-end request/response scenarios, including the close-vs-timeout
//! race: a request pending at disconnect must reject exactly once with
//! CONNECTION_CLOSED, never with TIMEOUT.

use helios_protocol::Frame;
use helios_test_utils::MockWsClient;
use serde_json::json;
use server::{
    Connection, HealthConfig, RequestError, Server, ServerConfig, ServerEvent,
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
// Server-to-client RPC happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_rpc_round_trips_to_the_client() {
    let (server, url) = start_server(quiet_config()).await;
    let mut events = server.events();
    let mut client = MockWsClient::connect(&url).await.expect("connect");
    let conn = wait_for_connection(&mut events).await;

    // The client answers every request with an echo response.
    let responder = tokio::spawn(async move {
        loop {
            match client.recv_frame().await {
                Ok(Frame::Request(request)) => {
                    let reply = Frame::response(request.id, json!({ "echo": request.payload }));
                    if client.send_frame(&reply).await.is_err() {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let response = server
        .request(&conn, "client.echo", json!({"n": 1}), None)
        .await
        .expect("echo response");
    assert_eq!(response.payload["echo"], json!({"n": 1}));
    responder.abort();
}

// ---------------------------------------------------------------------------
// Client-to-server RPC error shapes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_methods_return_an_error_shaped_response() {
    let (_server, url) = start_server(quiet_config()).await;
    let mut client = MockWsClient::connect(&url).await.expect("connect");

    let request = Frame::request("no.such.method", json!({}));
    let request_id = request.id().to_owned();
    client.send_frame(&request).await.expect("send");
    let response = client.recv_response(&request_id).await.expect("response");
    assert_eq!(response.payload["error"]["code"], "METHOD_NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Scenario: close races the request timer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_beats_timeout_and_rejects_exactly_once() {
    let (server, url) = start_server(quiet_config()).await;
    let mut events = server.events();
    let mut client = MockWsClient::connect(&url).await.expect("connect");
    let conn = wait_for_connection(&mut events).await;

    // A request the client will never answer, with a 1s deadline.
    let issued = tokio::spawn({
        let server = server.clone();
        let conn = conn.clone();
        async move {
            server
                .request(
                    &conn,
                    "client.slow",
                    json!({}),
                    Some(Duration::from_millis(1000)),
                )
                .await
        }
    });

    // The transport closes long before the deadline.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await.expect("close");

    let decided_at = std::time::Instant::now();
    let outcome = issued.await.expect("join");
    assert_eq!(outcome, Err(RequestError::ConnectionClosed));
    assert!(
        decided_at.elapsed() < Duration::from_millis(700),
        "rejection should come from the close, not the timer"
    );

    // Nothing is left to fire: the timer was cancelled with the waiter.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(conn.state().await, server::ConnectionState::Closed);
}
