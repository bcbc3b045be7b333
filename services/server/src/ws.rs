//! Thin WebSocket transport adapter.
//!
//! Accepts upgrades, allocates a transport handle, and runs the per-socket
//! loop: inbound frames go to the coordinator, outbound frames drain from
//! the connection's bounded queue.  The adapter does no protocol work
//! beyond framing; parse policy and lifecycle live in the coordinator.

use crate::connection::{OutboundFrame, Transport};
use crate::coordinator::{Inbound, Server};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bound on frames queued to one socket; `try_send` failure above this is
/// the not-writable signal surfaced to senders.
const OUTBOUND_BUFFER: usize = 64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Deserialize)]
pub struct UpgradeQuery {
    session_token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    Query(query): Query<UpgradeQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server, query.session_token))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<Server>, session_token: Option<String>) {
    let transport_id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);
    let conn = server
        .on_open(
            Transport {
                id: transport_id,
                outbound: outbound_tx,
            },
            session_token,
        )
        .await;
    debug!(connection_id = %conn.id(), transport_id, "socket attached");

    let mut close_code: u16 = 1000;
    let mut close_reason = String::new();

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let inbound = match inbound {
                    Some(Ok(Message::Text(text))) => Some(Inbound::Text(text.to_string())),
                    Some(Ok(Message::Binary(bytes))) => Some(Inbound::Binary(bytes.to_vec())),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                        None
                    }
                    Some(Ok(Message::Pong(_))) => {
                        server.on_pong(transport_id).await;
                        None
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            close_code = frame.code;
                            close_reason = frame.reason.to_string();
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %conn.id(), error = %e, "WS error");
                        close_code = 1006;
                        break;
                    }
                    None => {
                        close_code = 1006;
                        break;
                    }
                };
                if let Some(inbound) = inbound {
                    if let Err(e) = server.on_message(transport_id, inbound).await {
                        warn!(connection_id = %conn.id(), error = %e, "protocol error, closing");
                        close_code = 1008;
                        close_reason = "protocol error".to_owned();
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code,
                                reason: close_reason.clone().into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            queued = outbound_rx.recv() => match queued {
                Some(OutboundFrame::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        close_code = 1006;
                        break;
                    }
                }
                Some(OutboundFrame::Ping) => {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        close_code = 1006;
                        break;
                    }
                }
                Some(OutboundFrame::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.clone().into(),
                        })))
                        .await;
                    close_code = code;
                    close_reason = reason;
                    break;
                }
                None => break,
            },
        }
    }

    server.on_close(transport_id, close_code, close_reason).await;
    debug!(transport_id, "socket detached");
}
