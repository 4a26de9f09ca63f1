//! Keep-alive pings while the transport is open.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use deckhand_shared::ClientMessage;

use super::connection::OutboundFrame;

/// Spawn the heartbeat task for one transport.
///
/// Writes a ping into the outbound channel on every tick. Once the write
/// half shuts down the channel's receiver is gone, the send fails, and the
/// task cancels itself; it never outlives its transport.
pub(crate) fn spawn_heartbeat(
    tx: UnboundedSender<OutboundFrame>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the on-open ping already covers it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Ok(json) = serde_json::to_string(&ClientMessage::Ping) else {
                break;
            };
            if tx.send(OutboundFrame::Text(json)).is_err() {
                tracing::debug!("transport gone, stopping heartbeat");
                break;
            }
        }
    })
}
