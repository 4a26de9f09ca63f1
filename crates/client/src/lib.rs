//! Deckhand realtime client.
//!
//! The real-time layer of the deckhand deployment dashboard: a single shared
//! WebSocket connection per process that any number of independent consumers
//! subscribe to, with automatic reconnection, heartbeat keep-alive, and
//! server clock synchronization.
//!
//! ```no_run
//! use std::sync::Arc;
//! use deckhand_client::{RealtimeConfig, RealtimeHandle, SubscriptionOptions, WsManager};
//!
//! # fn main() -> Result<(), deckhand_client::RealtimeError> {
//! let manager = WsManager::new(RealtimeConfig::from_env())?;
//! let handle = RealtimeHandle::new(
//!     &manager,
//!     SubscriptionOptions {
//!         subscriber_id: None,
//!         deployment_id: Some("42".into()),
//!         user_id: Some("alice".into()),
//!         on_message: Arc::new(|msg| println!("{}: {:?}", msg.kind, msg.status)),
//!         on_error: None,
//!         on_close: None,
//!     },
//! );
//! # drop(handle);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ws;

pub use config::RealtimeConfig;
pub use error::RealtimeError;
pub use ws::{
    ConnectionState, ConnectionStatus, RealtimeHandle, ReconnectConfig, Subscriber,
    SubscriptionOptions, WsManager,
};
