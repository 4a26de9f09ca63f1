//! The shared deployment event socket: one transport, many subscribers.
//!
//! Consumers normally go through [`handle::RealtimeHandle`]; the manager's
//! own API ([`manager::WsManager`]) is the subscribe/unsubscribe/send
//! contract everything else is built on.

pub mod backoff;
pub mod clock;
mod connection;
pub mod handle;
mod heartbeat;
pub mod manager;
pub mod subscriber;

pub use backoff::ReconnectConfig;
pub use handle::{ConnectionStatus, RealtimeHandle, SubscriptionOptions};
pub use manager::{ConnectionState, WsManager};
pub use subscriber::{CloseInfo, Subscriber, WsEvent};
