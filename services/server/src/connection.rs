//! Per-connection state and operations.
//!
//! A [`Connection`] is the unit of client identity: its id, user data,
//! subscriptions and pending requests outlive the underlying transport,
//! which may be swapped by a session reconnect.  All observable effects for
//! one connection happen in the order its socket task delivers them; other
//! tasks (broadcast, sweep) only go through the methods here, which re-check
//! state under the connection's own locks.

use crate::dispatch::{DispatchContext, HandlerCtx, HandlerFailure};
use crate::error::{RequestError, SendError};
use helios_protocol::{error_codes, error_payload, Frame, Response};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-unique handle for one underlying WebSocket.
pub type TransportId = u64;

/// Frames queued from the server to one socket task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// The current underlying socket: its handle plus the bounded queue the
/// socket task drains.  `try_send` failure is the not-writable signal.
#[derive(Debug, Clone)]
pub struct Transport {
    pub id: TransportId,
    pub outbound: mpsc::Sender<OutboundFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// A waiter installed by [`Connection::request`].
///
/// Present in the pending map iff something still expects completion; each
/// record completes through exactly one of response / timeout / close.
struct PendingRequest {
    responder: oneshot::Sender<Result<Response, RequestError>>,
    timer: JoinHandle<()>,
}

/// Ping/pong bookkeeping for the current transport generation.
#[derive(Debug, Default)]
pub(crate) struct HealthState {
    pub(crate) last_ping_at: Option<Instant>,
    pub(crate) last_pong_at: Option<Instant>,
    pub(crate) missed_pongs: u32,
    pub(crate) monitor: Option<JoinHandle<()>>,
    pub(crate) pong_waiters: Vec<oneshot::Sender<Duration>>,
}

pub struct Connection {
    id: Uuid,
    /// Back-reference to the owning `Arc`, for tasks and contexts spawned
    /// from `&self` methods.
    self_ref: Weak<Connection>,
    session_id: RwLock<Option<String>>,
    state: RwLock<ConnectionState>,
    transport: RwLock<Option<Transport>>,
    user_data: RwLock<HashMap<String, serde_json::Value>>,
    subscriptions: RwLock<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    pub(crate) health: Mutex<HealthState>,
    last_token_refresh: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(transport: Transport) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: Uuid::new_v4(),
            self_ref: self_ref.clone(),
            session_id: RwLock::new(None),
            state: RwLock::new(ConnectionState::Open),
            transport: RwLock::new(Some(transport)),
            user_data: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthState::default()),
            last_token_refresh: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Assign the session id; a connection gets one at most once.
    pub(crate) async fn bind_session_id(&self, session_id: &str) -> bool {
        let mut slot = self.session_id.write().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(session_id.to_owned());
        true
    }

    pub(crate) async fn transport_id(&self) -> Option<TransportId> {
        self.transport.read().await.as_ref().map(|t| t.id)
    }

    // -----------------------------------------------------------------------
    // User data
    // -----------------------------------------------------------------------

    pub async fn set_user_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.user_data.write().await.insert(key.into(), value);
    }

    pub async fn user_data(&self, key: &str) -> Option<serde_json::Value> {
        self.user_data.read().await.get(key).cloned()
    }

    pub(crate) async fn clear_user_data(&self) {
        self.user_data.write().await.clear();
    }

    // -----------------------------------------------------------------------
    // Subscription mirror (owned by the room broker)
    // -----------------------------------------------------------------------

    pub async fn subscriptions(&self) -> HashSet<String> {
        self.subscriptions.read().await.clone()
    }

    pub(crate) async fn add_subscription(&self, topic: &str) {
        self.subscriptions.write().await.insert(topic.to_owned());
    }

    pub(crate) async fn remove_subscription(&self, topic: &str) {
        self.subscriptions.write().await.remove(topic);
    }

    pub(crate) async fn clear_subscriptions(&self) {
        self.subscriptions.write().await.clear();
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Queue raw text for the socket task.
    ///
    /// Fails fast: a non-OPEN connection rejects with `ConnectionClosed`,
    /// and a full outbound buffer rejects with `NotWritable` rather than
    /// blocking on transport back-pressure.
    pub async fn send_raw(&self, text: String) -> Result<(), SendError> {
        if self.state().await != ConnectionState::Open {
            return Err(SendError::ConnectionClosed);
        }
        let transport = self.transport.read().await;
        let Some(transport) = transport.as_ref() else {
            return Err(SendError::ConnectionClosed);
        };
        transport
            .outbound
            .try_send(OutboundFrame::Text(text))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::NotWritable,
                mpsc::error::TrySendError::Closed(_) => SendError::ConnectionClosed,
            })
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), SendError> {
        let text =
            helios_protocol::encode_frame(frame).map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_raw(text).await
    }

    /// Send a wire-level event to this client.
    pub async fn emit(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), SendError> {
        self.send_frame(&Frame::event(topic, payload)).await
    }

    pub(crate) async fn send_ping(&self) -> Result<(), SendError> {
        if self.state().await != ConnectionState::Open {
            return Err(SendError::ConnectionClosed);
        }
        let transport = self.transport.read().await;
        let Some(transport) = transport.as_ref() else {
            return Err(SendError::ConnectionClosed);
        };
        transport
            .outbound
            .try_send(OutboundFrame::Ping)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::NotWritable,
                mpsc::error::TrySendError::Closed(_) => SendError::ConnectionClosed,
            })
    }

    /// Ask the socket task to close the transport.
    pub(crate) async fn close_transport(&self, code: u16, reason: &str) {
        if let Some(transport) = self.transport.read().await.as_ref() {
            let _ = transport.outbound.try_send(OutboundFrame::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Request / response
    // -----------------------------------------------------------------------

    /// Issue an RPC to the client and await its response.
    ///
    /// Completes through exactly one of: a matching response, the deadline
    /// (`Timeout`), or connection close (`ConnectionClosed`).  Rejects
    /// synchronously without enqueueing when the connection is not OPEN.
    pub async fn request(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        if self.state().await != ConnectionState::Open {
            return Err(RequestError::ConnectionClosed);
        }

        let frame = Frame::request(method, payload);
        let request_id = frame.id().to_owned();
        let (responder, receiver) = oneshot::channel();

        let timer = tokio::spawn({
            let weak = self.self_ref.clone();
            let request_id = request_id.clone();
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(conn) = weak.upgrade() {
                    conn.expire_pending(&request_id).await;
                }
            }
        });
        self.pending
            .lock()
            .await
            .insert(request_id.clone(), PendingRequest { responder, timer });

        if let Err(e) = self.send_frame(&frame).await {
            if let Some(record) = self.pending.lock().await.remove(&request_id) {
                record.timer.abort();
            }
            return Err(RequestError::Send(e));
        }

        match receiver.await {
            Ok(outcome) => outcome,
            // Responder dropped without completing: the connection was torn
            // down under us.
            Err(_) => Err(RequestError::ConnectionClosed),
        }
    }

    /// Timeout path.  Rejecting only when this call is the one that removed
    /// the record keeps completion exactly-once: the close path drains the
    /// map (after aborting timers) before it rejects anything.
    async fn expire_pending(&self, request_id: &str) {
        if let Some(record) = self.pending.lock().await.remove(request_id) {
            let _ = record.responder.send(Err(RequestError::Timeout));
        }
    }

    /// Resolve the waiter for `request_id`, if one is still pending.
    pub(crate) async fn complete_pending(&self, request_id: &str, response: Response) -> bool {
        let Some(record) = self.pending.lock().await.remove(request_id) else {
            return false;
        };
        record.timer.abort();
        let _ = record.responder.send(Ok(response));
        true
    }

    /// Reject every pending request with `ConnectionClosed`.
    ///
    /// Timers are aborted before any waiter is rejected so a late timeout
    /// can never touch the drained map.
    pub(crate) async fn reject_all_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, record)| record).collect()
        };
        for record in &drained {
            record.timer.abort();
        }
        for record in drained {
            let _ = record.responder.send(Err(RequestError::ConnectionClosed));
        }
    }

    pub(crate) async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    // -----------------------------------------------------------------------
    // Incoming dispatch
    // -----------------------------------------------------------------------

    /// Route one parsed frame by genre.
    pub(crate) async fn handle_incoming(&self, frame: Frame, ctx: &DispatchContext) {
        // The connection is alive for the duration of any dispatch.
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        match frame {
            Frame::Request(request) => {
                let outcome = ctx
                    .methods
                    .dispatch(
                        &request.method,
                        HandlerCtx {
                            connection: this,
                            payload: request.payload,
                        },
                    )
                    .await;
                let payload = match outcome {
                    Ok(value) => value,
                    Err(HandlerFailure::MethodNotFound) => error_payload(
                        error_codes::METHOD_NOT_FOUND,
                        &format!("Unknown method: {}", request.method),
                    ),
                    Err(HandlerFailure::Failed(message)) => {
                        warn!(connection_id = %self.id, method = %request.method, error = %message, "method handler failed");
                        error_payload(error_codes::HANDLER_ERROR, &message)
                    }
                };
                if let Err(e) = self.send_frame(&Frame::response(request.id, payload)).await {
                    debug!(connection_id = %self.id, error = %e, "response not delivered");
                }
            }
            Frame::Response(response) => {
                if self.state().await != ConnectionState::Open {
                    debug!(connection_id = %self.id, request_id = %response.request_id, "response on non-open connection dropped");
                    return;
                }
                let request_id = response.request_id.clone();
                if !self.complete_pending(&request_id, response).await {
                    debug!(connection_id = %self.id, request_id = %request_id, "response matched no pending request");
                }
            }
            Frame::Event(event) => {
                ctx.topics.dispatch(this, event).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reconnection
    // -----------------------------------------------------------------------

    /// Swap in a new transport after session recovery.
    ///
    /// User data, subscriptions and pending requests are untouched; the
    /// health counters reset for the new transport generation.
    pub(crate) async fn reconnect(&self, new_transport: Transport) {
        *self.transport.write().await = Some(new_transport);
        self.set_state(ConnectionState::Open).await;

        let mut health = self.health.lock().await;
        if let Some(monitor) = health.monitor.take() {
            monitor.abort();
        }
        health.missed_pongs = 0;
        health.last_pong_at = Some(Instant::now());
        health.last_ping_at = None;
        health.pong_waiters.clear();
    }

    // -----------------------------------------------------------------------
    // Token refresh rate limiting
    // -----------------------------------------------------------------------

    pub(crate) async fn mark_token_refreshed(&self) {
        *self.last_token_refresh.lock().await = Some(Instant::now());
    }

    /// True iff a session is bound and at least half the TTL has elapsed
    /// since the last mint.
    pub async fn can_refresh_token(&self, ttl: Duration) -> bool {
        if self.session_id.read().await.is_none() {
            return false;
        }
        match *self.last_token_refresh.lock().await {
            Some(at) => at.elapsed() >= ttl / 2,
            None => true,
        }
    }

    /// Nonnegative remainder until the next refresh is allowed.
    pub async fn time_until_refresh_allowed(&self, ttl: Duration) -> Duration {
        match *self.last_token_refresh.lock().await {
            Some(at) => (ttl / 2).saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}
