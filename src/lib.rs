//! helios: structured real-time messaging over a single WebSocket
//! transport. Fire-and-forget events, correlated request/response RPC, and
//! room-based pub/sub, with session recovery across transport reconnects.
//!
//! This is the workspace root.  The server lives in `services/server`, the
//! wire protocol and topic matcher in `crates/helios-protocol`, and the
//! end-to-end suites under `tests/integration/`.
