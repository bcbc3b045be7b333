//! Failure domains for connection-level operations.
//!
//! Per-operation outcomes (subscribe, refresh) are structured results on
//! their own modules; these enums cover the send and request/response
//! paths, which reject through returned futures instead.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is not OPEN, or it has no transport attached.
    #[error("connection closed")]
    ConnectionClosed,
    /// The transport exists but its outbound buffer is full.
    #[error("transport not writable")]
    NotWritable,
    #[error("frame encode: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The per-request deadline elapsed while the connection was still live.
    #[error("request timed out")]
    Timeout,
    /// The connection closed before a response arrived, or the request was
    /// issued against a non-OPEN connection.
    #[error("connection closed before the response arrived")]
    ConnectionClosed,
    #[error("request send failed: {0}")]
    Send(#[from] SendError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PingError {
    /// No pong arrived within the manual-ping deadline.
    #[error("ping timed out")]
    Timeout,
    #[error("ping send failed: {0}")]
    Send(#[from] SendError),
}
