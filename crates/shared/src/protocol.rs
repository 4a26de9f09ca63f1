//! Messages exchanged over the deployment event socket.
//!
//! Inbound frames are deliberately loose: `WsMessage` carries a string
//! discriminator plus every optional field the server is known to emit, and
//! ignores anything it does not recognize. Unknown `type` values are valid
//! and reach subscribers unfiltered, so the server can introduce new event
//! kinds without a client release.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normal closure; sent by the client when the last subscriber leaves.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away (server restart, page navigation).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// True when a close code marks a deliberate shutdown that must not trigger
/// automatic reconnection.
pub fn is_clean_close(code: u16) -> bool {
    code == CLOSE_NORMAL || code == CLOSE_GOING_AWAY
}

/// Message type emitted by the manager itself when the transport opens or
/// closes, so subscribers can track connectivity in-band.
pub const TYPE_CONNECTION_STATUS: &str = "connection_status";
/// Keep-alive message type, sent in both directions.
pub const TYPE_PING: &str = "ping";

/// A server-to-client frame on the deployment event socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    /// Discriminator (`"ping"`, `"connection_status"`, deployment events, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// ISO-8601 server timestamp, used for clock synchronization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl WsMessage {
    /// An otherwise-empty frame with the given type.
    pub fn of_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            deployment_id: None,
            user_id: None,
            stage: None,
            status: None,
            progress: None,
            elapsed_time: None,
            message: None,
            connected: None,
            data: None,
            timestamp: None,
        }
    }

    /// The synthetic frame delivered to subscribers on transport open/close.
    pub fn connection_status(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            ..Self::of_kind(TYPE_CONNECTION_STATUS)
        }
    }
}

/// A client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive; sent immediately on open and on every heartbeat tick.
    Ping,
    /// Registers a subscriber server-side so it receives user-scoped events.
    Subscribe {
        subscriber_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deployment_id: Option<String>,
        user_id: String,
    },
}
