//! Per-consumer facade over the shared connection manager.
//!
//! A widget (or any other consumer) gets a [`RealtimeHandle`]: its own
//! subscriber registration plus a simplified status + send API. Dropping the
//! handle unregisters the subscriber, which is what eventually lets the
//! manager tear the transport down.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::manager::WsManager;
use super::subscriber::{CloseCallback, ErrorCallback, MessageCallback, Subscriber};

/// Simplified connection status for consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a consumer passes when registering.
pub struct SubscriptionOptions {
    /// Stable subscriber id; generated from the scope when omitted.
    pub subscriber_id: Option<String>,
    pub deployment_id: Option<String>,
    pub user_id: Option<String>,
    pub on_message: MessageCallback,
    pub on_error: Option<ErrorCallback>,
    pub on_close: Option<CloseCallback>,
}

/// A consumer's registration with the shared socket.
///
/// Runs a periodic health poll that re-derives the status from the manager
/// and proactively reconnects when the socket is found down — the
/// self-healing path for consumers that missed a close event.
pub struct RealtimeHandle {
    manager: WsManager,
    subscriber_id: String,
    status: Arc<Mutex<ConnectionStatus>>,
    health_poll: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn new(manager: &WsManager, options: SubscriptionOptions) -> Self {
        let subscriber_id = options.subscriber_id.unwrap_or_else(|| {
            let scope = options
                .deployment_id
                .as_deref()
                .or(options.user_id.as_deref())
                .unwrap_or("global");
            format!("{}-{}", scope, Uuid::new_v4().simple())
        });

        let status = Arc::new(Mutex::new(ConnectionStatus::Disconnected));

        // Wrap the consumer callbacks so transport events keep the status
        // cell current between polls.
        let on_error: ErrorCallback = {
            let status = status.clone();
            let inner = options.on_error;
            Arc::new(move |err| {
                *status.lock() = ConnectionStatus::Error;
                if let Some(cb) = &inner {
                    cb(err);
                }
            })
        };
        let on_close: CloseCallback = {
            let status = status.clone();
            let inner = options.on_close;
            Arc::new(move |info| {
                *status.lock() = ConnectionStatus::Disconnected;
                if let Some(cb) = &inner {
                    cb(info);
                }
            })
        };

        manager.subscribe(Subscriber {
            id: subscriber_id.clone(),
            deployment_id: options.deployment_id,
            user_id: options.user_id,
            on_message: options.on_message,
            on_error: Some(on_error),
            on_close: Some(on_close),
        });

        let health_poll = {
            let manager = manager.clone();
            let status = status.clone();
            let interval = manager.config().health_poll_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let derived = if manager.is_connected() {
                        ConnectionStatus::Connected
                    } else if manager.is_connecting() {
                        ConnectionStatus::Connecting
                    } else {
                        ConnectionStatus::Disconnected
                    };
                    *status.lock() = derived;
                    if derived == ConnectionStatus::Disconnected {
                        manager.connect();
                    }
                }
            })
        };

        Self {
            manager: manager.clone(),
            subscriber_id,
            status,
            health_poll,
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Send an arbitrary payload through the shared socket. Dropped with a
    /// warning when disconnected, like [`WsManager::send`].
    pub fn send<T: serde::Serialize + ?Sized>(&self, payload: &T) {
        self.manager.send(payload);
    }

    /// Explicit unregistration; equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.health_poll.abort();
        self.manager.unsubscribe(&self.subscriber_id);
    }
}

impl fmt::Debug for RealtimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHandle")
            .field("subscriber_id", &self.subscriber_id)
            .field("status", &self.status())
            .finish()
    }
}
