//! Supervised connection to a WebSocket echo server.
//!
//! Sends a greeting every time the connection (re)opens and logs everything that comes back.
//! Keepalive detection is disabled because public echo servers do not send keepalive payloads.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,resilient_ws=debug cargo run --example echo --features tracing -- wss://echo.websocket.org
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use resilient_ws::{ConnectionConfig, Event, WebSocket};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "wss://echo.websocket.org".to_owned());

    let config = ConnectionConfig::new(url)
        .without_keepalive()
        .with_retry_interval(Duration::from_secs(2));
    let ws = WebSocket::connect(config)?;
    let mut events = Box::pin(ws.events());
    let mut echoed = 0;

    while let Ok(Some(event)) = timeout(Duration::from_secs(30), events.next()).await {
        match event? {
            Event::Connected => {
                info!(protocol = ?ws.protocol(), "Connected");
                ws.send("hello from resilient-ws")?;
            }
            Event::Disconnected => warn!("Disconnected, reconnecting"),
            Event::Message(payload) => {
                info!(payload = ?payload.as_text(), bytes = payload.len(), "Echo");
                echoed += 1;
                if echoed >= 3 {
                    break;
                }
                ws.send(format!("message #{echoed}"))?;
            }
            Event::UnexpectedResponse {
                status,
                status_text,
            } => warn!(status, %status_text, "Upgrade rejected"),
            Event::Error(e) => warn!(error = %e, "Transport error"),
            event => info!(%event),
        }
    }

    ws.close(Some(1000), Some("done"))?;
    info!(state = %ws.state(), "Closed");

    Ok(())
}
