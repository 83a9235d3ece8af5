use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use shared_types::RpcClient;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::grain_directory::{ForeignHostDirectory, GrainDirectory};
use crate::session_cache::{ForeignHostnameCache, SessionCache};
use crate::wildcard::WildcardMatcher;

/// Shared application state, the gateway's analogue of the teacher's
/// `AppState` (`hypervisor/src/state.rs`).
pub struct AppState {
    pub config: Config,
    pub wildcard: WildcardMatcher,
    pub grain_directory: GrainDirectory,
    pub ui_sessions: Arc<SessionCache>,
    pub api_sessions: Arc<SessionCache>,
    pub foreign_hosts: ForeignHostnameCache,
    pub foreign_host_directory: ForeignHostDirectory,
    /// Lazily-dialed connection to the `Backend` capability; reconnected on
    /// disconnect rather than redialed per call.
    backend_client: Mutex<Option<Arc<RpcClient>>>,
    /// Served from `GET /metrics`.
    pub requests_total: AtomicU64,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let wildcard = WildcardMatcher::new(&config.wildcard_host);
        let grain_directory = GrainDirectory::new(&config.data_root);
        let ui_sessions = Arc::new(SessionCache::new(config.session_idle_timeout));
        let api_sessions = Arc::new(SessionCache::new(config.session_idle_timeout));
        let foreign_host_directory = ForeignHostDirectory::new(&config.data_root);
        Arc::new(Self {
            config,
            wildcard,
            grain_directory,
            ui_sessions,
            api_sessions,
            foreign_hosts: ForeignHostnameCache::new(),
            foreign_host_directory,
            backend_client: Mutex::new(None),
            requests_total: AtomicU64::new(0),
        })
    }

    /// Returns the cached `Backend` RPC client, dialing it if absent.
    pub async fn backend(&self) -> Result<Arc<RpcClient>, Error> {
        let mut guard = self.backend_client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }
        let stream = UnixStream::connect(&self.config.backend_socket_path)
            .await
            .map_err(|_| Error::Disconnected)?;
        let (read_half, write_half) = stream.into_split();
        let client = RpcClient::new(read_half, write_half);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Ensures a grain is running, returning once `backend::startGrain` has
    /// resolved — the boot-promise deduplication (spec.md §8 scenario 6)
    /// lives in `backend::registry`, not here.
    pub async fn ensure_grain_running(&self, grain_id: &str) -> Result<(), Error> {
        let entry = self.grain_directory.lookup(grain_id).await?;
        let backend = self.backend().await?;
        #[derive(serde::Serialize)]
        struct Params<'a> {
            grain_id: &'a str,
            package_id: &'a str,
            #[serde(rename = "is_retry")]
            is_retry: bool,
        }
        let _: serde_json::Value = backend
            .call(
                "Backend",
                "startGrain",
                &Params {
                    grain_id,
                    package_id: &entry.package_id,
                    is_retry: false,
                },
            )
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

pub const UI_SID_COOKIE: &str = "sandstorm-sid";
