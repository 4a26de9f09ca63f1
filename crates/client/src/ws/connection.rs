//! Transport loop over tokio-tungstenite.
//!
//! One `run_connection` task per transport generation. The task opens the
//! socket, hands the manager an outbound channel, then pumps the read half
//! until the connection dies and reports the close code back to the manager,
//! which decides whether to reconnect.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::heartbeat::spawn_heartbeat;
use super::manager::WsManager;

type Transport = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close frame carried no status code.
pub(crate) const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close handshake.
pub(crate) const CLOSE_ABNORMAL: u16 = 1006;

/// Frames queued for the write half of the transport.
#[derive(Debug)]
pub(crate) enum OutboundFrame {
    Text(String),
    /// Finish with a normal-closure close frame.
    Close,
}

pub(crate) async fn run_connection(manager: WsManager, epoch: u64, url: String) {
    let (stream, _response) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, %url, "failed to open deployment socket");
            manager.transport_open_failed(epoch);
            return;
        }
    };
    debug!(%url, "deployment socket open");

    let (write, read) = stream.split();
    let (tx, rx) = mpsc::unbounded_channel();

    if !manager.transport_opened(epoch, tx.clone()) {
        // A newer connect() superseded this transport while it was opening.
        return;
    }

    let write_task = tokio::spawn(write_loop(write, rx));
    let heartbeat = spawn_heartbeat(tx, manager.config().heartbeat_interval);

    let (code, reason) = read_loop(&manager, epoch, read).await;
    debug!(code, %reason, "deployment socket closed");

    heartbeat.abort();
    write_task.abort();
    manager.transport_closed(epoch, code, reason);
}

async fn write_loop(
    mut write: SplitSink<Transport, Message>,
    mut rx: UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Text(json) => {
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    warn!(error = %e, "write to deployment socket failed");
                    break;
                }
            }
            OutboundFrame::Close => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "no more subscribers".to_string().into(),
                };
                if let Err(e) = write.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "close frame not delivered");
                }
                break;
            }
        }
    }
}

/// Pump inbound frames until the connection ends; returns the close code and
/// reason. A close frame without a status maps to 1005; a stream that ends
/// or errors without a close handshake maps to 1006.
async fn read_loop(
    manager: &WsManager,
    epoch: u64,
    mut read: SplitStream<Transport>,
) -> (u16, String) {
    while let Some(item) = read.next().await {
        match item {
            Ok(Message::Text(text)) => manager.handle_frame(text.as_str()),
            Ok(Message::Close(frame)) => {
                return match frame {
                    Some(f) => (u16::from(f.code), f.reason.to_string()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
            }
            // Pongs are tungstenite's business; binary frames are not part
            // of the protocol.
            Ok(_) => {}
            Err(e) => {
                manager.transport_error(epoch, e.to_string());
                return (CLOSE_ABNORMAL, e.to_string());
            }
        }
    }
    (
        CLOSE_ABNORMAL,
        "connection dropped without close handshake".to_string(),
    )
}
