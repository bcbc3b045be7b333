//! The server coordinator.
//!
//! Wires transport events into the registry, the room broker and the
//! per-connection machinery, enforces the parse-mode and session-recovery
//! policies, and exposes the outward API (rooms, RPC registries, broadcast,
//! manual ping, the event bus).

use crate::config::{ConfigError, ParseMode, ServerConfig};
use crate::connection::{Connection, ConnectionState, Transport, TransportId};
use crate::dispatch::{DispatchContext, HandlerCtx, HandlerFailure, MethodRegistry, TopicRegistry};
use crate::error::{PingError, RequestError};
use crate::events::{self, EventBus, RawInbound, ServerEvent};
use crate::health;
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomBroker;
use crate::session_token::{SessionTokenCodec, TokenError};
use futures_util::FutureExt;
use helios_protocol::{Frame, Response};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Raw inbound data as delivered by the transport adapter.
#[derive(Debug, Clone)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("frame decode: {0}")]
    Decode(#[from] helios_protocol::ProtocolError),
    #[error("binary frames are not part of the protocol")]
    UnexpectedBinary,
}

/// Pre-dispatch gate: return `false` to drop a parsed frame before it is
/// handled.
pub type InboundFilter = Arc<dyn Fn(&Arc<Connection>, &Frame) -> bool + Send + Sync>;

pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<RoomBroker>,
    dispatch_ctx: DispatchContext,
    codec: Option<SessionTokenCodec>,
    bus: EventBus,
    inbound_filter: RwLock<Option<InboundFilter>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Build the coordinator, register the built-in RPC methods and, when
    /// session recovery is enabled, start the expiry sweep.
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let codec = if config.session_recovery.enabled {
            let secret = config
                .session_recovery
                .secret
                .as_deref()
                .ok_or(ConfigError::MissingSecret)?;
            Some(SessionTokenCodec::new(secret.as_bytes()).map_err(|_| ConfigError::MissingSecret)?)
        } else {
            None
        };
        let bus = events::bus();
        let server = Arc::new(Self {
            registry: Arc::new(ConnectionRegistry::new()),
            broker: Arc::new(RoomBroker::new(bus.clone())),
            dispatch_ctx: DispatchContext {
                methods: Arc::new(MethodRegistry::new()),
                topics: Arc::new(TopicRegistry::new()),
            },
            codec,
            bus,
            inbound_filter: RwLock::new(None),
            sweep: Mutex::new(None),
            config,
        });
        server.register_builtins().await;
        if server.config.session_recovery.enabled {
            let sweep = server.spawn_sweep();
            *server.sweep.lock().await = Some(sweep);
        }
        Ok(server)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<RoomBroker> {
        &self.broker
    }

    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.dispatch_ctx.methods
    }

    pub fn topics(&self) -> &Arc<TopicRegistry> {
        &self.dispatch_ctx.topics
    }

    /// Subscribe to the server-side event bus.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.bus.subscribe()
    }

    pub async fn set_inbound_filter(&self, filter: InboundFilter) {
        *self.inbound_filter.write().await = Some(filter);
    }

    /// Issue an RPC to a client, defaulting the deadline from config.
    pub async fn request(
        &self,
        conn: &Arc<Connection>,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Response, RequestError> {
        conn.request(
            method,
            payload,
            timeout.unwrap_or(self.config.request_timeout),
        )
        .await
    }

    /// Measure one ping round trip to a client.
    pub async fn ping(&self, conn: &Arc<Connection>) -> Result<Duration, PingError> {
        health::ping(conn).await
    }

    /// Fan an event out through the room broker.
    pub async fn broadcast(
        &self,
        topic: &str,
        data: &serde_json::Value,
    ) -> crate::rooms::BroadcastReport {
        self.broker.broadcast(topic, data).await
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    /// A transport finished its upgrade.
    ///
    /// With recovery enabled and a token on the upgrade URL, a verified
    /// session rebinds its previous connection; any verification failure
    /// downgrades to a fresh session plus a `session:recovery-failed`
    /// event.
    pub async fn on_open(
        &self,
        transport: Transport,
        session_token: Option<String>,
    ) -> Arc<Connection> {
        let mut recovery_failure: Option<String> = None;

        if self.config.session_recovery.enabled {
            if let (Some(token), Some(codec)) = (session_token.as_deref(), self.codec.as_ref()) {
                match codec.verify(token) {
                    Ok(record) => {
                        if let Some(conn) = self
                            .registry
                            .reconnect(&record.session_id, transport.clone())
                            .await
                        {
                            info!(connection_id = %conn.id(), session_id = %record.session_id, "session recovered");
                            let _ = conn
                                .emit(
                                    "session:recovered",
                                    json!({
                                        "sessionId": record.session_id,
                                        "metadata": record.metadata,
                                    }),
                                )
                                .await;
                            let _ = self.bus.send(ServerEvent::SessionRecovered {
                                connection: conn.clone(),
                                session_id: record.session_id,
                            });
                            health::start(&conn, &self.config.health_check, self.bus.clone())
                                .await;
                            return conn;
                        }
                        recovery_failure =
                            Some("session expired or unknown, not recoverable".to_owned());
                    }
                    Err(TokenError::Expired) => {
                        recovery_failure = Some("session token expired".to_owned());
                    }
                    Err(e) => {
                        recovery_failure = Some(format!("invalid session token: {e}"));
                    }
                }
            }
        }

        let conn = self.registry.register(transport).await;
        info!(connection_id = %conn.id(), "connection opened");
        let _ = self.bus.send(ServerEvent::ConnectionOpened {
            connection: conn.clone(),
        });

        if let Some(reason) = recovery_failure {
            warn!(connection_id = %conn.id(), reason = %reason, "session recovery failed");
            let _ = conn
                .emit("session:recovery-failed", json!({ "reason": reason }))
                .await;
            let _ = self
                .bus
                .send(ServerEvent::SessionRecoveryFailed { reason });
        }

        if self.config.session_recovery.enabled {
            self.create_session(&conn).await;
        }
        health::start(&conn, &self.config.health_check, self.bus.clone()).await;
        conn
    }

    /// Mint a token, bind the session id, tell the client.
    async fn create_session(&self, conn: &Arc<Connection>) {
        let Some(codec) = self.codec.as_ref() else {
            return;
        };
        let ttl = self.config.session_recovery.ttl;
        let session_id = Uuid::new_v4().to_string();
        let token = match codec.mint(&session_id, &conn.id().to_string(), &json!({}), ttl) {
            Ok(token) => token,
            Err(e) => {
                error!(connection_id = %conn.id(), error = %e, "session token mint failed");
                return;
            }
        };
        if !self.registry.bind_session(conn, &session_id).await {
            return;
        }
        conn.mark_token_refreshed().await;
        let _ = conn
            .emit(
                "session:created",
                json!({ "token": token, "ttl": ttl.as_millis() as u64 }),
            )
            .await;
        let _ = self.bus.send(ServerEvent::SessionCreated {
            connection: conn.clone(),
            session_id,
        });
    }

    /// One raw message from a transport.
    ///
    /// An `Err` is only returned in strict parse mode; the transport
    /// adapter reacts by closing the socket.
    pub async fn on_message(
        &self,
        transport_id: TransportId,
        inbound: Inbound,
    ) -> Result<(), InboundError> {
        let Some(conn) = self.registry.get(transport_id).await else {
            debug!(transport_id, "message for unknown transport dropped (close race)");
            return Ok(());
        };

        let text = match inbound {
            Inbound::Text(text) => text,
            Inbound::Binary(bytes) => {
                if self.config.parse_mode == ParseMode::Strict {
                    return Err(InboundError::UnexpectedBinary);
                }
                let _ = self.bus.send(ServerEvent::RawMessage {
                    connection: conn,
                    payload: RawInbound::Binary(bytes),
                });
                return Ok(());
            }
        };

        match helios_protocol::parse_frame(&text) {
            Ok(frame) => {
                let kind = frame_kind(&frame);
                let _ = self.bus.send(ServerEvent::InboundFrame {
                    connection: conn.clone(),
                    kind,
                });
                let vetoed = {
                    let filter = self.inbound_filter.read().await;
                    filter.as_ref().is_some_and(|f| !f(&conn, &frame))
                };
                if vetoed {
                    let _ = self.bus.send(ServerEvent::InboundDropped {
                        connection: conn,
                        kind,
                    });
                    return Ok(());
                }
                conn.handle_incoming(frame, &self.dispatch_ctx).await;
                Ok(())
            }
            Err(e) => match self.config.parse_mode {
                ParseMode::Strict => Err(e.into()),
                ParseMode::Permissive => {
                    let payload = match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => RawInbound::Json(value),
                        Err(_) => RawInbound::Text(text),
                    };
                    let _ = self.bus.send(ServerEvent::RawMessage {
                        connection: conn,
                        payload,
                    });
                    Ok(())
                }
                ParseMode::Passthrough => {
                    let _ = self.bus.send(ServerEvent::RawMessage {
                        connection: conn,
                        payload: RawInbound::Text(text),
                    });
                    Ok(())
                }
            },
        }
    }

    /// A transport closed.
    ///
    /// Session-bearing connections park in the disconnected set with their
    /// user data, subscriptions and pending requests intact; everything
    /// else is torn down completely.
    pub async fn on_close(&self, transport_id: TransportId, code: u16, reason: String) {
        let Some(conn) = self.registry.get(transport_id).await else {
            return;
        };
        conn.set_state(ConnectionState::Closing).await;
        health::stop(&conn).await;

        let recoverable =
            self.config.session_recovery.enabled && conn.session_id().await.is_some();
        if recoverable {
            self.registry
                .mark_disconnected(transport_id, self.config.session_recovery.ttl)
                .await;
            conn.set_state(ConnectionState::Closed).await;
            info!(connection_id = %conn.id(), code, "connection parked for session recovery");
        } else {
            conn.reject_all_pending().await;
            self.broker.cleanup(&conn).await;
            conn.clear_user_data().await;
            conn.set_state(ConnectionState::Closed).await;
            self.registry.remove(transport_id).await;
            info!(connection_id = %conn.id(), code, "connection closed");
        }
        let _ = self.bus.send(ServerEvent::Disconnection {
            connection: conn,
            code,
            reason,
        });
    }

    /// A pong frame arrived on a transport.
    pub async fn on_pong(&self, transport_id: TransportId) {
        if let Some(conn) = self.registry.get(transport_id).await {
            health::on_pong(&conn, &self.bus).await;
        }
    }

    // -----------------------------------------------------------------------
    // Expired-session sweep
    // -----------------------------------------------------------------------

    fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.config.session_recovery.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(server) = weak.upgrade() else { break };
                for conn in server.registry.collect_expired().await {
                    server.finalize_expired(&conn).await;
                }
            }
        })
    }

    /// Final cleanup for a session whose recovery window elapsed.
    async fn finalize_expired(&self, conn: &Arc<Connection>) {
        health::stop(conn).await;
        conn.reject_all_pending().await;
        self.broker.cleanup(conn).await;
        conn.clear_user_data().await;
        info!(connection_id = %conn.id(), "expired session cleaned up");
    }

    // -----------------------------------------------------------------------
    // Built-in RPC methods
    // -----------------------------------------------------------------------

    async fn register_builtins(self: &Arc<Self>) {
        let methods = self.methods();

        let broker = self.broker.clone();
        methods
            .register("helios.subscribe", move |ctx: HandlerCtx| {
                let broker = broker.clone();
                async move {
                    let Some(topic) = ctx
                        .payload
                        .get("topic")
                        .and_then(|v| v.as_str())
                        .map(ToOwned::to_owned)
                    else {
                        return Ok(json!({ "ok": false, "error": "Missing topic" }));
                    };
                    let data = ctx.payload.get("data").cloned();
                    let outcome = broker.subscribe(&ctx.connection, &topic, data).await;
                    Ok(outcome.to_payload())
                }
                .boxed()
            })
            .await;

        let broker = self.broker.clone();
        methods
            .register("helios.unsubscribe", move |ctx: HandlerCtx| {
                let broker = broker.clone();
                async move {
                    let Some(topic) = ctx
                        .payload
                        .get("topic")
                        .and_then(|v| v.as_str())
                        .map(ToOwned::to_owned)
                    else {
                        return Ok(json!({ "ok": false, "error": "Missing topic" }));
                    };
                    let removed = broker.unsubscribe(&ctx.connection, &topic).await;
                    Ok(json!({ "ok": removed }))
                }
                .boxed()
            })
            .await;

        let codec = self.codec.clone();
        let bus = self.bus.clone();
        let ttl = self.config.session_recovery.ttl;
        methods
            .register("session.refresh", move |ctx: HandlerCtx| {
                let codec = codec.clone();
                let bus = bus.clone();
                async move {
                    let conn = ctx.connection;
                    let (Some(session_id), Some(codec)) = (conn.session_id().await, codec) else {
                        return Ok(json!({ "error": "No active session" }));
                    };
                    if !conn.can_refresh_token(ttl).await {
                        let wait = conn.time_until_refresh_allowed(ttl).await;
                        return Ok(json!({
                            "error": "Rate limit exceeded",
                            "waitMs": wait.as_millis() as u64,
                        }));
                    }
                    let token = codec
                        .mint(&session_id, &conn.id().to_string(), &json!({}), ttl)
                        .map_err(|e| HandlerFailure::Failed(e.to_string()))?;
                    conn.mark_token_refreshed().await;
                    let _ = conn
                        .emit(
                            "session:refreshed",
                            json!({ "token": token, "sessionId": session_id }),
                        )
                        .await;
                    let _ = bus.send(ServerEvent::SessionRefreshed {
                        connection: conn.clone(),
                        token: token.clone(),
                    });
                    Ok(json!({ "success": true, "token": token, "sessionId": session_id }))
                }
                .boxed()
            })
            .await;
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Request(_) => "request",
        Frame::Response(_) => "response",
        Frame::Event(_) => "event",
    }
}
