//! deckhand-watch - tail the deployment event socket from a terminal.
//!
//! A thin smoke tool around the client library: registers one subscriber
//! and logs every event until interrupted. Useful for checking what the
//! dashboard would see without running the dashboard.

use std::sync::Arc;

use deckhand_client::{RealtimeConfig, RealtimeHandle, SubscriptionOptions, WsManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("deckhand_client=debug")),
        )
        .init();

    let config = RealtimeConfig::from_env();
    let endpoint = config.endpoint_url()?;
    tracing::info!(%endpoint, "watching deployment events");

    let manager = WsManager::new(config)?;
    let handle = RealtimeHandle::new(
        &manager,
        SubscriptionOptions {
            subscriber_id: Some("deckhand-watch".to_string()),
            deployment_id: std::env::var("DECKHAND_DEPLOYMENT_ID").ok(),
            user_id: std::env::var("DECKHAND_USER_ID").ok(),
            on_message: Arc::new(|msg| {
                tracing::info!(
                    kind = %msg.kind,
                    stage = msg.stage.as_deref().unwrap_or("-"),
                    status = msg.status.as_deref().unwrap_or("-"),
                    progress = msg.progress.unwrap_or(0.0),
                    "event"
                );
            }),
            on_error: Some(Arc::new(|err| {
                tracing::warn!(%err, "socket error");
            })),
            on_close: Some(Arc::new(|info| {
                tracing::warn!(code = info.code, reason = %info.reason, "socket closed");
            })),
        },
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(offset_ms = manager.server_time_offset_ms(), "shutting down");
    drop(handle);
    manager.shutdown();
    Ok(())
}
