//! Client-side error types.

use thiserror::Error;

/// Errors surfaced by the realtime client's public API.
///
/// Almost everything in this crate is deliberately infallible (sends while
/// disconnected are dropped with a warning, malformed frames are ignored);
/// the exceptions are configuration problems that should fail fast.
#[derive(Debug, Clone, Error)]
pub enum RealtimeError {
    #[error("invalid websocket base url `{url}`: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("unsupported url scheme `{0}` (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
}
