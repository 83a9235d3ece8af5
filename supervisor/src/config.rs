//! Typed configuration loaded from the environment, following the teacher's
//! `hypervisor/src/config.rs` `env_parse`/`env_str` idiom.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// `/var/sandstorm/grains/<id>`.
    pub grain_dir: PathBuf,
    /// `/var/sandstorm/apps/<package-id>/sandbox`.
    pub app_sandbox_dir: PathBuf,
    pub grain_id: String,
    /// argv/env taken from the package manifest's main command.
    pub command: shared_types::Command,
    pub mount_proc: bool,
    pub dev_mode: bool,
    pub idle_timeout: Duration,
    pub shutdown_grace: Duration,
    pub log_rotate_threshold_bytes: u64,
    pub log_rotate_interval: Duration,
    /// Cgroup v2 directory this grain's processes join (spec.md §4.1 step 8).
    pub cgroup_path: PathBuf,
    /// Named Unix-domain socket the `Supervisor` capability is served on,
    /// in place of spec.md §4.1's literal fd-3 socket pair — see
    /// `backend::capability::spawn_supervisor`'s doc comment for why.
    pub rpc_socket_path: PathBuf,
    /// Named socket the forked `http-bridge` process serves `WebSession` on.
    pub bridge_socket_path: PathBuf,
    /// Named socket `http-bridge` accepts raw WebSocket-upgrade relay
    /// connections on (gateway dials this directly, bypassing the
    /// JSON-RPC `WebSession` capability for the byte-pump phase).
    pub bridge_ws_socket_path: PathBuf,
    pub http_bridge_binary: PathBuf,
    /// Address the app's own HTTP server listens on, forwarded to
    /// `http-bridge` so it knows where to proxy `WebSession` calls.
    pub app_http_addr: String,
}

impl Config {
    pub fn from_env(command: shared_types::Command) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let data_root: PathBuf = env_str("SANDSTORM_DATA_ROOT", "/var/sandstorm").into();
        let grain_id = std::env::var("SANDSTORM_GRAIN_ID")
            .map_err(|_| anyhow::anyhow!("SANDSTORM_GRAIN_ID must be set"))?;
        let package_id = std::env::var("SANDSTORM_PACKAGE_ID")
            .map_err(|_| anyhow::anyhow!("SANDSTORM_PACKAGE_ID must be set"))?;

        Ok(Self {
            grain_dir: data_root.join("grains").join(&grain_id),
            app_sandbox_dir: data_root.join("apps").join(&package_id).join("sandbox"),
            grain_id: grain_id.clone(),
            command,
            mount_proc: env_parse("SANDSTORM_MOUNT_PROC", false)?,
            dev_mode: env_parse("SANDSTORM_DEV_MODE", false)?,
            idle_timeout: Duration::from_secs(env_parse("SANDSTORM_IDLE_TIMEOUT_SECS", 600)?),
            shutdown_grace: Duration::from_secs(env_parse("SANDSTORM_SHUTDOWN_GRACE_SECS", 10)?),
            log_rotate_threshold_bytes: env_parse(
                "SANDSTORM_LOG_ROTATE_THRESHOLD_BYTES",
                1024 * 1024,
            )?,
            log_rotate_interval: Duration::from_secs(env_parse(
                "SANDSTORM_LOG_ROTATE_INTERVAL_SECS",
                300,
            )?),
            cgroup_path: data_root.join("cgroup").join("grains").join(&grain_id),
            rpc_socket_path: env_str(
                "SANDSTORM_RPC_SOCKET_PATH",
                data_root
                    .join("grains")
                    .join(&grain_id)
                    .join("rpc.sock")
                    .to_str()
                    .unwrap_or_default(),
            )
            .into(),
            bridge_socket_path: env_str(
                "SANDSTORM_BRIDGE_SOCKET_PATH",
                data_root
                    .join("grains")
                    .join(&grain_id)
                    .join("bridge.sock")
                    .to_str()
                    .unwrap_or_default(),
            )
            .into(),
            bridge_ws_socket_path: env_str(
                "SANDSTORM_BRIDGE_WS_SOCKET_PATH",
                data_root
                    .join("grains")
                    .join(&grain_id)
                    .join("bridge-ws.sock")
                    .to_str()
                    .unwrap_or_default(),
            )
            .into(),
            http_bridge_binary: env_str(
                "SANDSTORM_HTTP_BRIDGE_BINARY",
                "/usr/local/bin/sandstorm-http-bridge",
            )
            .into(),
            app_http_addr: env_str("SANDSTORM_APP_HTTP_ADDR", "127.0.0.1:8080"),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
