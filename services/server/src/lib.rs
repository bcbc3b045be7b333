pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod registry;
pub mod rooms;
pub mod session_token;
pub mod ws;

pub use config::{HealthConfig, ParseMode, ServerConfig, SessionRecoveryConfig};
pub use connection::{Connection, ConnectionState};
pub use coordinator::{Inbound, Server};
pub use dispatch::{EventCtx, HandlerCtx, HandlerFailure};
pub use error::{PingError, RequestError, SendError};
pub use events::ServerEvent;
pub use rooms::{RoomKind, SubscribeOutcome, Validator, ValidatorCtx, ValidatorFailure};

use axum::{routing::get, Router};
use std::sync::Arc;

pub fn build_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/healthz", get(probes::healthz))
        .with_state(server)
}

mod probes {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
