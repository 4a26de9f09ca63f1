//! End-to-end tests against a loopback WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use deckhand_client::ws::ReconnectConfig;
use deckhand_client::{RealtimeConfig, RealtimeHandle, Subscriber, SubscriptionOptions, WsManager};
use deckhand_shared::WsMessage;

type ServerWs = WebSocketStream<TcpStream>;

struct TestServer {
    base_url: String,
    sockets: mpsc::UnboundedReceiver<ServerWs>,
    accepted: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, sockets) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(ws).is_err() {
                    break;
                }
            }
        });
        Self {
            base_url: format!("ws://{}", addr),
            sockets,
            accepted,
        }
    }

    fn config(&self) -> RealtimeConfig {
        RealtimeConfig {
            base_url: self.base_url.clone(),
            idle_grace: Duration::from_millis(200),
            health_poll_interval: Duration::from_millis(100),
            reconnect: ReconnectConfig {
                initial_delay_ms: 50,
                max_delay_ms: 200,
                ..ReconnectConfig::default()
            },
            ..RealtimeConfig::default()
        }
    }

    async fn next_socket(&mut self) -> ServerWs {
        timeout(Duration::from_secs(5), self.sockets.recv())
            .await
            .expect("no connection arrived")
            .expect("server stopped")
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn next_json(ws: &mut ServerWs) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame arrived")
            .expect("connection ended")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("invalid json from client");
        }
    }
}

async fn next_close_code(ws: &mut ServerWs) -> u16 {
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no close arrived")
        {
            Some(Ok(Message::Close(frame))) => {
                return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("connection ended without close frame"),
        }
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn collecting_subscriber(id: &str, user_id: Option<&str>) -> (Subscriber, Arc<Mutex<Vec<WsMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let sub = Subscriber {
        id: id.to_string(),
        deployment_id: None,
        user_id: user_id.map(str::to_string),
        on_message: Arc::new(move |msg| {
            sink.lock().unwrap().push(msg);
        }),
        on_error: None,
        on_close: None,
    };
    (sub, seen)
}

fn events_of(seen: &Arc<Mutex<Vec<WsMessage>>>, kind: &str) -> Vec<WsMessage> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|m| m.kind == kind)
        .cloned()
        .collect()
}

#[tokio::test]
async fn many_subscribers_share_one_transport() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (a, _) = collecting_subscriber("a", None);
    let (b, _) = collecting_subscriber("b", None);
    let (c, _) = collecting_subscriber("c", None);
    manager.subscribe(a);
    manager.subscribe(b);
    manager.subscribe(c);

    wait_for(|| manager.is_connected(), "connection").await;
    let _socket = server.next_socket().await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(server.accepted(), 1);
    assert_eq!(manager.subscriber_count(), 3);
    manager.shutdown();
}

#[tokio::test]
async fn open_sends_ping_then_registers_user_scoped_subscribers() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (sub, _) = collecting_subscriber("dash", Some("alice"));
    let sub = Subscriber {
        deployment_id: Some("42".to_string()),
        ..sub
    };
    manager.subscribe(sub);

    let mut ws = server.next_socket().await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "ping");
    let second = next_json(&mut ws).await;
    assert_eq!(second["type"], "subscribe");
    assert_eq!(second["subscriber_id"], "dash");
    assert_eq!(second["deployment_id"], "42");
    assert_eq!(second["user_id"], "alice");
    manager.shutdown();
}

#[tokio::test]
async fn late_joiner_with_user_id_is_registered_immediately() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (listener, _) = collecting_subscriber("listener", None);
    manager.subscribe(listener);
    let mut ws = server.next_socket().await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "ping");
    wait_for(|| manager.is_connected(), "connection").await;

    let (late, _) = collecting_subscriber("late", Some("bob"));
    manager.subscribe(late);
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["subscriber_id"], "late");
    assert_eq!(frame["user_id"], "bob");
    manager.shutdown();
}

#[tokio::test]
async fn fanout_reaches_every_subscriber_in_order() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (a, seen_a) = collecting_subscriber("a", None);
    let (c, seen_c) = collecting_subscriber("c", None);
    let panicking = Subscriber {
        id: "b".to_string(),
        deployment_id: None,
        user_id: None,
        on_message: Arc::new(|_| panic!("subscriber b is broken")),
        on_error: None,
        on_close: None,
    };
    manager.subscribe(a);
    manager.subscribe(panicking);
    manager.subscribe(c);

    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;
    ws.send(Message::Text(
        r#"{"type":"deployment_status","stage":"build","status":"running"}"#.into(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"type":"deployment_status","stage":"deploy","status":"running"}"#.into(),
    ))
    .await
    .unwrap();

    wait_for(
        || events_of(&seen_a, "deployment_status").len() == 2,
        "subscriber a deliveries",
    )
    .await;
    wait_for(
        || events_of(&seen_c, "deployment_status").len() == 2,
        "subscriber c deliveries",
    )
    .await;

    let a_events = events_of(&seen_a, "deployment_status");
    assert_eq!(a_events[0].stage.as_deref(), Some("build"));
    assert_eq!(a_events[1].stage.as_deref(), Some("deploy"));
    manager.shutdown();
}

#[tokio::test]
async fn reregistering_an_id_replaces_the_subscriber() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (old, seen_old) = collecting_subscriber("widget", None);
    manager.subscribe(old);
    wait_for(|| manager.is_connected(), "connection").await;
    let (new, seen_new) = collecting_subscriber("widget", None);
    manager.subscribe(new);
    assert_eq!(manager.subscriber_count(), 1);

    let mut ws = server.next_socket().await;
    ws.send(Message::Text(r#"{"type":"deployment_status"}"#.into()))
        .await
        .unwrap();

    wait_for(
        || events_of(&seen_new, "deployment_status").len() == 1,
        "replacement delivery",
    )
    .await;
    assert!(events_of(&seen_old, "deployment_status").is_empty());
    manager.shutdown();
}

#[tokio::test]
async fn malformed_frames_are_dropped_silently() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (sub, seen) = collecting_subscriber("a", None);
    manager.subscribe(sub);
    wait_for(|| manager.is_connected(), "connection").await;

    let mut ws = server.next_socket().await;
    ws.send(Message::Text("not json at all".into())).await.unwrap();
    ws.send(Message::Text(r#"{"status":"missing type"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"still_alive"}"#.into()))
        .await
        .unwrap();

    wait_for(|| !events_of(&seen, "still_alive").is_empty(), "good frame").await;
    assert!(manager.is_connected());
    let delivered = seen.lock().unwrap().len();
    // connection_status + the one good frame; the two bad ones vanished.
    assert_eq!(delivered, 2);
    manager.shutdown();
}

#[tokio::test]
async fn grace_period_absorbs_rapid_remounts() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (a, _) = collecting_subscriber("a", None);
    manager.subscribe(a);
    wait_for(|| manager.is_connected(), "connection").await;
    let _socket = server.next_socket().await;

    manager.unsubscribe("a");
    let (b, _) = collecting_subscriber("b", None);
    manager.subscribe(b);

    // Well past the 200ms grace period.
    sleep(Duration::from_millis(600)).await;
    assert!(manager.is_connected());
    assert_eq!(server.accepted(), 1);
    manager.shutdown();
}

#[tokio::test]
async fn idle_teardown_closes_with_normal_code() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (a, _) = collecting_subscriber("a", None);
    manager.subscribe(a);
    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;

    manager.unsubscribe("a");
    assert_eq!(next_close_code(&mut ws).await, 1000);
    wait_for(|| !manager.is_connected(), "teardown").await;
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn abnormal_close_reconnects() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let close_count = closes.clone();
    manager.subscribe(Subscriber {
        id: "a".to_string(),
        deployment_id: None,
        user_id: None,
        on_message: Arc::new(|_| {}),
        on_error: None,
        on_close: Some(Arc::new(move |_| {
            close_count.fetch_add(1, Ordering::SeqCst);
        })),
    });

    wait_for(|| manager.is_connected(), "first connection").await;
    let mut ws = server.next_socket().await;
    ws.close(Some(CloseFrame {
        code: CloseCode::from(1011),
        reason: "server fault".to_string().into(),
    }))
    .await
    .unwrap();

    wait_for(|| server.accepted() >= 2, "reconnection").await;
    wait_for(|| manager.is_connected(), "second connection").await;
    wait_for(|| closes.load(Ordering::SeqCst) >= 1, "close notification").await;
    manager.shutdown();
}

#[tokio::test]
async fn going_away_close_does_not_reconnect() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (a, _) = collecting_subscriber("a", None);
    manager.subscribe(a);
    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;

    ws.close(Some(CloseFrame {
        code: CloseCode::Away,
        reason: "restarting".to_string().into(),
    }))
    .await
    .unwrap();

    wait_for(|| !manager.is_connected(), "close").await;
    sleep(Duration::from_millis(600)).await;
    assert_eq!(server.accepted(), 1);
    assert!(!manager.is_connected());
    manager.shutdown();
}

#[tokio::test]
async fn exhausted_attempt_budget_stops_reconnecting() {
    let mut server = TestServer::start().await;
    let mut config = server.config();
    config.reconnect.max_attempts = 0;
    let manager = WsManager::new(config).unwrap();

    let (a, _) = collecting_subscriber("a", None);
    manager.subscribe(a);
    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;

    ws.close(Some(CloseFrame {
        code: CloseCode::from(1011),
        reason: "server fault".to_string().into(),
    }))
    .await
    .unwrap();

    wait_for(|| !manager.is_connected(), "close").await;
    sleep(Duration::from_millis(600)).await;
    assert_eq!(server.accepted(), 1);
    manager.shutdown();
}

#[tokio::test]
async fn server_timestamps_drive_the_clock_offset() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let (sub, seen) = collecting_subscriber("a", None);
    manager.subscribe(sub);
    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;

    let ahead = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    ws.send(Message::Text(
        format!(r#"{{"type":"deployment_status","timestamp":"{}"}}"#, ahead).into(),
    ))
    .await
    .unwrap();

    wait_for(
        || manager.server_time_offset_ms() > 3_500_000,
        "offset update",
    )
    .await;
    let offset = manager.server_time_offset_ms();
    assert!(offset < 3_700_000, "offset {} out of range", offset);

    // A message without a timestamp leaves the offset untouched.
    ws.send(Message::Text(r#"{"type":"no_timestamp"}"#.into()))
        .await
        .unwrap();
    wait_for(|| !events_of(&seen, "no_timestamp").is_empty(), "delivery").await;
    assert_eq!(manager.server_time_offset_ms(), offset);
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_subscriber_sees_every_frame() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.subscribe(Subscriber {
        id: "slow".to_string(),
        deployment_id: None,
        user_id: None,
        on_message: Arc::new(move |msg| {
            // Slower than the inbound rate; frames must queue, not vanish.
            std::thread::sleep(Duration::from_millis(10));
            sink.lock().unwrap().push(msg);
        }),
        on_error: None,
        on_close: None,
    });

    wait_for(|| manager.is_connected(), "connection").await;
    let mut ws = server.next_socket().await;
    for i in 0..20 {
        ws.send(Message::Text(
            format!(r#"{{"type":"deployment_status","stage":"stage_{}"}}"#, i).into(),
        ))
        .await
        .unwrap();
    }

    wait_for(
        || events_of(&seen, "deployment_status").len() == 20,
        "every frame delivered",
    )
    .await;
    let delivered = events_of(&seen, "deployment_status");
    assert_eq!(delivered[0].stage.as_deref(), Some("stage_0"));
    assert_eq!(delivered[19].stage.as_deref(), Some("stage_19"));
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resubscribe_racing_the_grace_timer_keeps_service() {
    let mut server = TestServer::start().await;
    let mut config = server.config();
    // Zero grace so the teardown timer fires into the middle of the churn.
    config.idle_grace = Duration::ZERO;
    let manager = WsManager::new(config).unwrap();

    let (first, _) = collecting_subscriber("widget", None);
    manager.subscribe(first);
    wait_for(|| manager.is_connected(), "connection").await;
    let _socket = server.next_socket().await;

    for _ in 0..50 {
        manager.unsubscribe("widget");
        let (again, _) = collecting_subscriber("widget", None);
        manager.subscribe(again);
    }

    // Whatever interleaving the timer hit, the surviving subscriber must end
    // up with a live transport, not a closed one.
    wait_for(|| manager.is_connected(), "live transport").await;
    assert_eq!(manager.subscriber_count(), 1);
    manager.shutdown();
}

#[tokio::test]
async fn handle_tracks_status_and_unsubscribes_on_drop() {
    let mut server = TestServer::start().await;
    let manager = WsManager::new(server.config()).unwrap();

    let handle = RealtimeHandle::new(
        &manager,
        SubscriptionOptions {
            subscriber_id: Some("widget".to_string()),
            deployment_id: None,
            user_id: None,
            on_message: Arc::new(|_| {}),
            on_error: None,
            on_close: None,
        },
    );

    wait_for(|| handle.is_connected(), "connection").await;
    wait_for(
        || handle.status() == deckhand_client::ConnectionStatus::Connected,
        "status poll",
    )
    .await;
    assert_eq!(handle.status().to_string(), "connected");

    handle.send(&serde_json::json!({"type": "ping"}));
    let mut ws = server.next_socket().await;
    // on-open ping, then the explicit one.
    assert_eq!(next_json(&mut ws).await["type"], "ping");
    assert_eq!(next_json(&mut ws).await["type"], "ping");

    drop(handle);
    assert_eq!(manager.subscriber_count(), 0);
    assert_eq!(next_close_code(&mut ws).await, 1000);
    wait_for(|| !manager.is_connected(), "teardown").await;
}

#[tokio::test]
async fn handle_self_heals_after_a_missed_disconnect() {
    let mut server = TestServer::start().await;
    let mut config = server.config();
    // No automatic reconnection: recovery must come from the health poll.
    config.reconnect.max_attempts = 0;
    let manager = WsManager::new(config).unwrap();

    let handle = RealtimeHandle::new(
        &manager,
        SubscriptionOptions {
            subscriber_id: Some("widget".to_string()),
            deployment_id: None,
            user_id: None,
            on_message: Arc::new(|_| {}),
            on_error: None,
            on_close: None,
        },
    );

    wait_for(|| handle.is_connected(), "first connection").await;
    let mut ws = server.next_socket().await;
    ws.close(Some(CloseFrame {
        code: CloseCode::from(1011),
        reason: "server fault".to_string().into(),
    }))
    .await
    .unwrap();

    wait_for(|| server.accepted() >= 2, "health poll reconnection").await;
    wait_for(|| handle.is_connected(), "recovery").await;
    drop(handle);
    manager.shutdown();
}
