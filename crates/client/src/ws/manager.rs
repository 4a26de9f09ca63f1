//! The connection manager: one shared transport, many subscribers.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use deckhand_shared::{is_clean_close, ClientMessage, WsMessage};

use crate::config::RealtimeConfig;
use crate::error::RealtimeError;

use super::clock::ServerClock;
use super::connection::{run_connection, OutboundFrame};
use super::subscriber::{spawn_forwarder, CloseInfo, Registry, Subscriber, WsEvent};

/// Connection state for the shared transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Deliberate teardown in progress (idle grace period elapsed or
    /// explicit disconnect); the close that follows must not reconnect.
    ClosingForIdle,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, ConnectionState::Connecting)
    }
}

#[derive(Default)]
struct ManagerState {
    conn: ConnectionState,
    registry: Registry,
    /// Write half of the live transport; present only while connected.
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    /// Reconnect attempts since the last successful open.
    reconnect_attempts: u32,
    /// Transport generation; guards against stale tasks mutating state
    /// after a newer connect().
    epoch: u64,
    conn_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

struct Shared {
    config: RealtimeConfig,
    endpoint: String,
    clock: ServerClock,
    state: Mutex<ManagerState>,
}

/// Owner of the single deployment event socket for the whole process.
///
/// Construct one at application start and hand clones to every consumer
/// (clones share the same connection); call [`WsManager::shutdown`] at exit.
/// The transport opens when the first subscriber registers and closes a
/// grace period after the last one leaves, reconnecting with exponential
/// backoff in between whenever the server drops the connection abnormally.
#[derive(Clone)]
pub struct WsManager {
    shared: Arc<Shared>,
}

impl WsManager {
    /// Create a manager. Fails only on an unusable base URL, so a
    /// misconfigured deployment dies at startup instead of retrying forever.
    pub fn new(config: RealtimeConfig) -> Result<Self, RealtimeError> {
        let endpoint = config.endpoint_url()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                endpoint,
                clock: ServerClock::default(),
                state: Mutex::new(ManagerState::default()),
            }),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    /// Open the transport unless it is already open or opening.
    ///
    /// Any stale transport task from a previous generation is torn down
    /// first. Safe to call repeatedly; the facade's health poll does.
    pub fn connect(&self) {
        let mut st = self.shared.state.lock();
        if st.conn.is_connected() || st.conn.is_connecting() {
            return;
        }
        if let Some(task) = st.conn_task.take() {
            task.abort();
        }
        st.outbound = None;
        if let Some(timer) = st.reconnect_timer.take() {
            timer.abort();
        }
        st.conn = ConnectionState::Connecting;
        st.epoch += 1;
        let epoch = st.epoch;
        let manager = self.clone();
        let url = self.shared.endpoint.clone();
        debug!(%url, epoch, "opening deployment socket");
        st.conn_task = Some(tokio::spawn(run_connection(manager, epoch, url)));
    }

    /// Deliberately close the transport (normal-closure code), cancelling
    /// any pending reconnect. The close that follows will not reconnect.
    pub fn disconnect(&self) {
        let mut st = self.shared.state.lock();
        close_transport(&mut st);
    }

    /// Register a subscriber (replacing any existing one with the same id).
    ///
    /// The first subscriber overall opens the transport; a late joiner with
    /// a `user_id` is registered server-side immediately instead of waiting
    /// for the next open event.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let connect_now = {
            let mut st = self.shared.state.lock();
            if let Some(timer) = st.grace_timer.take() {
                timer.abort();
            }
            let was_empty = st.registry.is_empty();

            let (queue, events) = mpsc::unbounded_channel();
            let forwarder = spawn_forwarder(
                events,
                subscriber.on_message.clone(),
                subscriber.on_error.clone(),
                subscriber.on_close.clone(),
            );

            if st.conn.is_connected() {
                if let (Some(tx), Some(user_id)) = (st.outbound.as_ref(), subscriber.user_id.as_ref()) {
                    queue_frame(
                        tx,
                        &ClientMessage::Subscribe {
                            subscriber_id: subscriber.id.clone(),
                            deployment_id: subscriber.deployment_id.clone(),
                            user_id: user_id.clone(),
                        },
                    );
                }
            }

            st.registry.upsert(&subscriber, queue, forwarder);
            debug!(subscriber = %subscriber.id, total = st.registry.len(), "subscriber registered");

            if was_empty {
                // Fresh cycle: a terminal manager (exhausted attempts) gets
                // its budget back when subscribers return.
                st.reconnect_attempts = 0;
            }
            was_empty
        };
        if connect_now {
            self.connect();
        }
    }

    /// Remove a subscriber. When the registry empties, teardown is deferred
    /// by the idle grace period so rapid remounts never churn the transport.
    pub fn unsubscribe(&self, id: &str) {
        let mut st = self.shared.state.lock();
        if !st.registry.remove(id) {
            return;
        }
        debug!(subscriber = %id, remaining = st.registry.len(), "subscriber removed");
        if st.registry.is_empty() {
            if let Some(timer) = st.grace_timer.take() {
                timer.abort();
            }
            let manager = self.clone();
            let grace = self.shared.config.idle_grace;
            st.grace_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                manager.idle_teardown();
            }));
        }
    }

    /// Serialize and send a message if connected; otherwise drop it with a
    /// warning. Never queues, never errors.
    pub fn send<T: serde::Serialize + ?Sized>(&self, message: &T) {
        let st = self.shared.state.lock();
        let (true, Some(tx)) = (st.conn.is_connected(), st.outbound.as_ref()) else {
            warn!("deployment socket not connected, dropping outbound message");
            return;
        };
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = tx.send(OutboundFrame::Text(json));
            }
            Err(e) => warn!(error = %e, "failed to serialize outbound message"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().conn.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.state.lock().conn.is_connecting()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().conn
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().registry.len()
    }

    /// Last-known `server clock - local clock` in milliseconds.
    pub fn server_time_offset_ms(&self) -> i64 {
        self.shared.clock.offset_ms()
    }

    /// Tear everything down: timers, transport, subscribers. The manager is
    /// reusable afterwards, but this is meant for application exit.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock();
        if let Some(timer) = st.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(timer) = st.grace_timer.take() {
            timer.abort();
        }
        if let Some(tx) = st.outbound.take() {
            let _ = tx.send(OutboundFrame::Close);
        }
        if let Some(task) = st.conn_task.take() {
            task.abort();
        }
        st.registry.clear();
        st.conn = ConnectionState::Disconnected;
        info!("deployment socket manager shut down");
    }

    // ---- transport callbacks (called from the connection task) ----

    /// The transport opened. Returns false when this generation is stale and
    /// the caller should bail out.
    pub(crate) fn transport_opened(&self, epoch: u64, tx: mpsc::UnboundedSender<OutboundFrame>) -> bool {
        let mut st = self.shared.state.lock();
        if st.epoch != epoch {
            return false;
        }
        st.conn = ConnectionState::Connected;
        st.reconnect_attempts = 0;

        queue_frame(&tx, &ClientMessage::Ping);
        st.registry
            .broadcast(&WsEvent::Message(WsMessage::connection_status(true)));

        // Re-register every user-scoped subscriber with the server; plain
        // listeners only consume fan-out.
        for (subscriber_id, deployment_id, user_id) in st.registry.user_scoped() {
            queue_frame(
                &tx,
                &ClientMessage::Subscribe {
                    subscriber_id,
                    deployment_id,
                    user_id,
                },
            );
        }

        st.outbound = Some(tx);
        info!("deployment socket connected");
        true
    }

    /// Opening the transport failed. No retry from here: the facade health
    /// poll (or the next subscriber churn) re-invokes connect().
    pub(crate) fn transport_open_failed(&self, epoch: u64) {
        let mut st = self.shared.state.lock();
        if st.epoch != epoch {
            return;
        }
        st.conn = ConnectionState::Disconnected;
        st.conn_task = None;
    }

    /// A transport error; fan it out. Reconnection is driven solely by the
    /// close that always follows.
    pub(crate) fn transport_error(&self, epoch: u64, error: String) {
        let st = self.shared.state.lock();
        if st.epoch != epoch {
            return;
        }
        warn!(%error, "deployment socket error");
        st.registry.broadcast(&WsEvent::Error(error));
    }

    /// An inbound frame. Malformed payloads are dropped silently; anything
    /// well-formed updates the server clock and reaches every subscriber,
    /// unknown types included.
    pub(crate) fn handle_frame(&self, text: &str) {
        let msg: WsMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return;
            }
        };
        if let Some(ts) = msg.timestamp.as_deref() {
            self.shared.clock.observe(ts);
        }
        tracing::trace!(kind = %msg.kind, "fan-out");
        self.shared
            .state
            .lock()
            .registry
            .broadcast(&WsEvent::Message(msg));
    }

    /// The transport closed. Notify subscribers, then reconnect iff the
    /// closure was abnormal, not deliberate, and the attempt budget allows.
    pub(crate) fn transport_closed(&self, epoch: u64, code: u16, reason: String) {
        let mut st = self.shared.state.lock();
        if st.epoch != epoch {
            return;
        }
        let deliberate = st.conn == ConnectionState::ClosingForIdle;
        st.conn = ConnectionState::Disconnected;
        st.outbound = None;
        st.conn_task = None;

        st.registry.broadcast(&WsEvent::Closed(CloseInfo {
            code,
            reason: reason.clone(),
        }));

        if deliberate || is_clean_close(code) {
            info!(code, "deployment socket closed");
            return;
        }
        let max = self.shared.config.reconnect.max_attempts;
        if st.reconnect_attempts >= max {
            warn!(code, attempts = st.reconnect_attempts, "giving up on reconnection");
            return;
        }
        let delay = self
            .shared
            .config
            .reconnect
            .delay_for_attempt(st.reconnect_attempts);
        st.reconnect_attempts += 1;
        info!(
            code,
            attempt = st.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnecting after abnormal close"
        );
        let manager = self.clone();
        st.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.connect();
        }));
    }

    /// Grace-period timer body. The emptiness check and the teardown run in
    /// one critical section: a racing subscribe either lands first and keeps
    /// the registry non-empty here, or lands after and reopens the transport
    /// through its own connect().
    fn idle_teardown(&self) {
        let mut st = self.shared.state.lock();
        st.grace_timer = None;
        if !st.registry.is_empty() {
            return;
        }
        debug!("no subscribers after grace period, closing transport");
        close_transport(&mut st);
    }
}

/// Deliberately close the transport (or abort a pending open), cancelling
/// any scheduled reconnect. Must run under the state lock.
fn close_transport(st: &mut ManagerState) {
    if let Some(timer) = st.reconnect_timer.take() {
        timer.abort();
    }
    if let Some(tx) = st.outbound.take() {
        st.conn = ConnectionState::ClosingForIdle;
        let _ = tx.send(OutboundFrame::Close);
    } else {
        if let Some(task) = st.conn_task.take() {
            task.abort();
        }
        st.conn = ConnectionState::Disconnected;
    }
}

fn queue_frame(tx: &mpsc::UnboundedSender<OutboundFrame>, msg: &ClientMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(OutboundFrame::Text(json));
        }
        Err(e) => warn!(error = %e, "failed to serialize protocol frame"),
    }
}

impl std::fmt::Debug for WsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("WsManager")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &st.conn)
            .field("subscribers", &st.registry.len())
            .field("reconnect_attempts", &st.reconnect_attempts)
            .finish()
    }
}
