mod admin;
mod config;
mod dispatch;
mod error;
mod grain_directory;
mod security_headers;
mod session_cache;
mod set_cookie;
mod smtp;
mod state;
mod tls;
mod web_session_bridge;
mod wildcard;
mod ws_proxy;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use state::AppState;
use tls::GatewayTlsManager;

/// Multi-thread runtime: the gateway is node-local and not sandboxed, and
/// benefits from OS parallelism across many concurrent client connections
/// (SPEC_FULL.md §5).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        base_url = %config.base_url,
        wildcard_host = %config.wildcard_host,
        "gateway starting",
    );

    let state = AppState::new(config.clone());

    tokio::spawn(session_cache::run_purge_loop(
        Arc::clone(&state.ui_sessions),
        config.session_purge_interval,
    ));
    tokio::spawn(session_cache::run_purge_loop(
        Arc::clone(&state.api_sessions),
        config.session_purge_interval,
    ));
    tokio::spawn({
        let state = Arc::clone(&state);
        let interval = config.session_purge_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.foreign_hosts.purge_expired();
            }
        }
    });

    let tls = GatewayTlsManager::new();
    if let (Some(cert), Some(key)) = (&config.tls_cert_path, &config.tls_key_path) {
        tls.load_from_files(cert, key)?;
    }

    {
        let smtp_addr = format!("{}:{}", config.bind_ip, config.smtp_port);
        let shell_smtp_addr = config.shell_smtp_addr.clone();
        let tls = Arc::clone(&tls);
        let listener = TcpListener::bind(&smtp_addr).await?;
        info!(%smtp_addr, "smtp proxy listening");
        tokio::spawn(smtp::run(listener, shell_smtp_addr, tls));
    }

    let app = Router::new()
        .route("/healthz", get(admin::healthz))
        .route("/metrics", get(admin::metrics))
        .fallback(dispatch::route)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let https_app = app.clone();
    let https_addr = format!("{}:{}", config.bind_ip, config.https_port);
    let https_tcp_listener = TcpListener::bind(&https_addr).await?;
    info!(%https_addr, "gateway listening (https, waiting for TLS material)");
    tokio::spawn(async move {
        let https_listener = TlsListener::new(https_tcp_listener, tls);
        if let Err(e) = axum::serve(https_listener, https_app).await {
            error!(error = %e, "https listener exited");
        }
    });

    let http_addr = format!("{}:{}", config.bind_ip, config.http_port);
    let http_listener = TcpListener::bind(&http_addr).await?;
    info!(%http_addr, "gateway listening (http)");

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Adapts a plain `TcpListener` plus a [`GatewayTlsManager`] into an
/// `axum::serve::Listener`, so the HTTPS side runs through the same
/// `axum::serve` driver as HTTP instead of hand-rolled `hyper` connection
/// plumbing. Each `accept` waits on the TLS manager having material loaded
/// at least once (SPEC_FULL.md §4.3's readiness gating) before handshaking,
/// so a cert pushed after startup is picked up without a restart.
struct TlsListener {
    inner: TcpListener,
    tls: Arc<GatewayTlsManager>,
}

impl TlsListener {
    fn new(inner: TcpListener, tls: Arc<GatewayTlsManager>) -> Self {
        Self { inner, tls }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.inner.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "https accept failed");
                    continue;
                }
            };
            let acceptor: TlsAcceptor = self.tls.ready_acceptor().await;
            match acceptor.accept(stream).await {
                Ok(tls_stream) => return (tls_stream, addr),
                Err(e) => {
                    error!(%addr, error = %e, "https handshake failed");
                    continue;
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
