//! Internal server event bus.
//!
//! Server-side observers subscribe to a `broadcast` channel of
//! [`ServerEvent`]s.  This bus is distinct from wire-level client events,
//! which leave through [`crate::connection::Connection::emit`]; the two are
//! deliberately named differently (`publish` vs `emit`).

use crate::connection::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const BUS_CAPACITY: usize = 256;

pub type EventBus = broadcast::Sender<ServerEvent>;

/// Raw inbound payloads routed by the permissive/passthrough parse modes.
#[derive(Debug, Clone)]
pub enum RawInbound {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ConnectionOpened {
        connection: Arc<Connection>,
    },
    Disconnection {
        connection: Arc<Connection>,
        code: u16,
        reason: String,
    },
    SessionCreated {
        connection: Arc<Connection>,
        session_id: String,
    },
    SessionRecovered {
        connection: Arc<Connection>,
        session_id: String,
    },
    SessionRecoveryFailed {
        reason: String,
    },
    SessionRefreshed {
        connection: Arc<Connection>,
        token: String,
    },
    RoomSubscribed {
        connection: Arc<Connection>,
        topic: String,
    },
    RoomUnsubscribed {
        connection: Arc<Connection>,
        topic: String,
    },
    PingMissed {
        connection: Arc<Connection>,
        missed_pongs: u32,
    },
    PongReceived {
        connection: Arc<Connection>,
        latency: Duration,
    },
    PingTimeout {
        connection: Arc<Connection>,
    },
    /// Pre-dispatch notification, named by frame kind
    /// (`request` / `response` / `event`).
    InboundFrame {
        connection: Arc<Connection>,
        kind: &'static str,
    },
    /// A frame vetoed by the inbound filter before dispatch.
    InboundDropped {
        connection: Arc<Connection>,
        kind: &'static str,
    },
    /// Unparseable input downgraded by a non-strict parse mode.
    RawMessage {
        connection: Arc<Connection>,
        payload: RawInbound,
    },
}

pub fn bus() -> EventBus {
    broadcast::channel(BUS_CAPACITY).0
}
