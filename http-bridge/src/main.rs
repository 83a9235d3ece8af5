mod bridge;
mod status;
mod websocket;
mod ws_relay;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bridge::HttpBridge;

/// Single-thread runtime: the bridge runs inside the grain sandbox
/// alongside the app, one event loop per spec.md §5.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "http_bridge=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let app_addr = std::env::var("SANDSTORM_APP_HTTP_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let timeout_secs: u64 = std::env::var("SANDSTORM_BRIDGE_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    info!(%app_addr, "http-bridge starting");

    let ws_app_addr = app_addr.clone();
    let bridge = Arc::new(HttpBridge::new(app_addr, Duration::from_secs(timeout_secs)));

    // Named socket the supervisor forks us with, in place of spec.md §4.1's
    // literal fd-3 socket pair (see `backend::capability::spawn_supervisor`'s
    // doc comment for the rationale shared across all three processes).
    let socket_path = std::env::var("SANDSTORM_BRIDGE_SOCKET_PATH")
        .unwrap_or_else(|_| "/tmp/sandstorm-bridge.sock".to_string());
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!(%socket_path, "http-bridge listening");

    // Raw WebSocket relay socket: gateway dials this directly for the
    // upgrade + byte-pump phase, bypassing the JSON-RPC `WebSession`
    // capability entirely (see `ws_relay` for why).
    let ws_socket_path = std::env::var("SANDSTORM_BRIDGE_WS_SOCKET_PATH")
        .unwrap_or_else(|_| "/tmp/sandstorm-bridge-ws.sock".to_string());
    let _ = std::fs::remove_file(&ws_socket_path);
    let ws_listener = UnixListener::bind(&ws_socket_path)?;
    info!(socket_path = %ws_socket_path, "http-bridge ws relay listening");
    tokio::spawn(ws_relay::run(ws_listener, ws_app_addr));

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "bridge listener accept failed");
                return Ok(());
            }
        };
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(shared_types::rpc::serve(
            read_half,
            write_half,
            Arc::clone(&bridge),
        ));
    }
}
