mod backup;
mod capability;
mod config;
mod error;
mod package_store;
mod reaper;
mod registry;

use std::sync::Arc;

use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use capability::Backend;
use config::Config;
use package_store::PackageStore;
use registry::GrainRegistry;

/// Multi-thread runtime: the backend is a node-local, always-on service
/// multiplexing many grains and package installs at once (spec.md §5),
/// unlike the per-grain `supervisor`/`http-bridge` processes.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "backend=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(data_root = %config.data_root.display(), "backend starting");

    tokio::fs::create_dir_all(config.apps_dir()).await?;
    tokio::fs::create_dir_all(config.grains_dir()).await?;
    tokio::fs::create_dir_all(config.packages_scratch_dir()).await?;
    tokio::fs::create_dir_all(config.backups_dir()).await?;
    if let Some(parent) = config.rpc_socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Reaps any helper process the backend forks directly (zip/unzip for
    // backup/restore); supervisors reap their own grain init.
    let _reaper = reaper::Reaper::install();

    let registry = GrainRegistry::new(config.grains_dir());
    let packages = PackageStore::new(config.apps_dir(), config.packages_scratch_dir());
    let backend = Backend::new(config.clone(), registry, packages);

    let _ = std::fs::remove_file(&config.rpc_socket_path);
    let listener = UnixListener::bind(&config.rpc_socket_path)?;
    info!(socket = %config.rpc_socket_path.display(), "backend listening");

    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "backend listener accept failed");
                return Ok(());
            }
        };
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(shared_types::rpc::serve(
            read_half,
            write_half,
            Arc::clone(&backend),
        ));
    }
}
