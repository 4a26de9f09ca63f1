//! Subscriber registry and fan-out.
//!
//! The manager does not invoke subscriber callbacks directly. Each registered
//! subscriber owns an unbounded event queue drained by its own forwarder
//! task; the manager pushes every transport event into every queue in
//! arrival order. The queue guarantees loss-free in-order delivery no matter
//! how slow a callback is, and a misbehaving callback (including a panic) is
//! confined to its own task.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use deckhand_shared::WsMessage;

/// Why the transport closed, as delivered to `on_close` callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// An event fanned out to every registered subscriber.
#[derive(Debug, Clone)]
pub enum WsEvent {
    /// An inbound frame (or a synthetic `connection_status` message).
    Message(WsMessage),
    /// A transport error; always followed by a `Closed` event.
    Error(String),
    /// The transport closed.
    Closed(CloseInfo),
}

pub type MessageCallback = Arc<dyn Fn(WsMessage) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(CloseInfo) + Send + Sync>;

/// A consumer of the shared deployment event socket.
///
/// Identity is the `id`: registering a second subscriber with the same id
/// replaces the first. Subscribers carrying a `user_id` are additionally
/// registered server-side with a `subscribe` frame; the rest are
/// fan-out-only listeners.
pub struct Subscriber {
    pub id: String,
    pub deployment_id: Option<String>,
    pub user_id: Option<String>,
    pub on_message: MessageCallback,
    pub on_error: Option<ErrorCallback>,
    pub on_close: Option<CloseCallback>,
}

struct Registered {
    deployment_id: Option<String>,
    user_id: Option<String>,
    queue: mpsc::UnboundedSender<WsEvent>,
    forwarder: JoinHandle<()>,
}

impl Drop for Registered {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Registry of live subscribers, keyed by id.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Registered>,
}

impl Registry {
    /// Insert or replace a subscriber. A replaced entry's forwarder is
    /// stopped, so the old callbacks see nothing further.
    pub fn upsert(
        &mut self,
        subscriber: &Subscriber,
        queue: mpsc::UnboundedSender<WsEvent>,
        forwarder: JoinHandle<()>,
    ) {
        self.entries.insert(
            subscriber.id.clone(),
            Registered {
                deployment_id: subscriber.deployment_id.clone(),
                user_id: subscriber.user_id.clone(),
                queue,
                forwarder,
            },
        );
    }

    /// Remove a subscriber; returns false if the id was unknown.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Push one event into every subscriber's queue. The queues are
    /// unbounded, so delivery never blocks and never skips; a send only
    /// fails for an entry whose forwarder is already gone.
    pub fn broadcast(&self, event: &WsEvent) {
        for entry in self.entries.values() {
            let _ = entry.queue.send(event.clone());
        }
    }

    /// Snapshot of `(id, deployment_id, user_id)` for subscribers that need
    /// server-side registration on (re)connect.
    pub fn user_scoped(&self) -> Vec<(String, Option<String>, String)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .user_id
                    .clone()
                    .map(|user_id| (id.clone(), entry.deployment_id.clone(), user_id))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Spawn the delivery task for one subscriber. Ends when the queue's sender
/// side is dropped (the subscriber left the registry).
pub(crate) fn spawn_forwarder(
    mut rx: mpsc::UnboundedReceiver<WsEvent>,
    on_message: MessageCallback,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                WsEvent::Message(msg) => on_message(msg),
                WsEvent::Error(err) => {
                    if let Some(cb) = &on_error {
                        cb(err);
                    }
                }
                WsEvent::Closed(info) => {
                    if let Some(cb) = &on_close {
                        cb(info);
                    }
                }
            }
        }
    })
}
