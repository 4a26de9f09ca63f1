//! Client configuration from environment variables.

use std::time::Duration;

use url::Url;

use crate::error::RealtimeError;
use crate::ws::backoff::ReconnectConfig;

/// Configuration for the shared deployment event socket.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the dashboard server (`ws://`, `wss://`, `http://` or
    /// `https://`; http schemes are mapped to their ws equivalents).
    pub base_url: String,
    /// Resource segment of the socket path: `/api/v1/ws/<resource>`.
    pub resource: String,
    /// Interval between keep-alive pings while connected.
    pub heartbeat_interval: Duration,
    /// Delay between the last subscriber leaving and transport teardown.
    pub idle_grace: Duration,
    /// Interval at which facades re-derive their status and self-heal.
    pub health_poll_interval: Duration,
    /// Reconnect pacing after abnormal closures.
    pub reconnect: ReconnectConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8080".to_string(),
            resource: "deployments".to_string(),
            heartbeat_interval: Duration::from_secs(25),
            idle_grace: Duration::from_millis(1000),
            health_poll_interval: Duration::from_secs(2),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    ///
    /// Environment variables:
    /// - `DECKHAND_WS_URL`: server base URL (default: "ws://localhost:8080")
    /// - `DECKHAND_WS_RESOURCE`: socket resource segment (default: "deployments")
    /// - `DECKHAND_WS_HEARTBEAT_MS`: ping interval (default: 25000)
    /// - `DECKHAND_WS_GRACE_MS`: idle teardown grace period (default: 1000)
    /// - `DECKHAND_WS_HEALTH_POLL_MS`: facade poll interval (default: 2000)
    /// - `DECKHAND_WS_MAX_RECONNECTS`: reconnect attempt budget (default: 10)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("DECKHAND_WS_URL") {
            config.base_url = v;
        }
        if let Ok(v) = std::env::var("DECKHAND_WS_RESOURCE") {
            config.resource = v;
        }
        if let Ok(v) = std::env::var("DECKHAND_WS_HEARTBEAT_MS") {
            if let Ok(ms) = v.parse() {
                config.heartbeat_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("DECKHAND_WS_GRACE_MS") {
            if let Ok(ms) = v.parse() {
                config.idle_grace = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("DECKHAND_WS_HEALTH_POLL_MS") {
            if let Ok(ms) = v.parse() {
                config.health_poll_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("DECKHAND_WS_MAX_RECONNECTS") {
            if let Ok(n) = v.parse() {
                config.reconnect.max_attempts = n;
            }
        }

        config
    }

    /// Resolve the full socket endpoint, normalizing http schemes to ws.
    ///
    /// Fails on a base URL that cannot be parsed or carries a scheme no
    /// websocket transport can speak.
    pub fn endpoint_url(&self) -> Result<String, RealtimeError> {
        let trimmed = self.base_url.trim_end_matches('/');
        let url = Url::parse(trimmed).map_err(|e| RealtimeError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        let scheme = match url.scheme() {
            "ws" | "wss" => url.scheme().to_string(),
            "http" => "ws".to_string(),
            "https" => "wss".to_string(),
            other => return Err(RealtimeError::UnsupportedScheme(other.to_string())),
        };

        let rest = trimmed
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(trimmed);

        Ok(format!("{}://{}/api/v1/ws/{}", scheme, rest, self.resource))
    }
}
