//! Typed configuration loaded from the environment, following the
//! teacher's `env_parse`/`env_str` idiom (`hypervisor/src/config.rs`).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub https_port: u16,
    pub smtp_port: u16,
    pub bind_ip: String,
    /// The gateway's own front door, e.g. `example.com` (spec.md §4.3 rule 1).
    pub base_url: String,
    /// `*.example.com`-style pattern the `WildcardMatcher` is built from.
    pub wildcard_host: String,
    /// Address of the shell HTTP backend (rules 1, 2).
    pub shell_addr: String,
    /// Address of the shell's plaintext SMTP backend the STARTTLS proxy
    /// hands connections off to.
    pub shell_smtp_addr: String,
    pub data_root: PathBuf,
    /// Unix-domain socket the `backend` capability is served on.
    pub backend_socket_path: PathBuf,
    pub session_purge_interval: Duration,
    pub session_idle_timeout: Duration,
    /// TTL applied to a foreign-hostname cache entry when the directory
    /// lookup doesn't name one itself (e.g. an unresolved host), per
    /// spec.md §3's "TTL is advertised by the router" — this is the
    /// fallback when there's nothing to advertise.
    pub foreign_hostname_unknown_ttl: Duration,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let data_root: PathBuf = env_str("SANDSTORM_DATA_ROOT", "/var/sandstorm").into();

        Ok(Self {
            http_port: env_parse("PORT", 8080)?,
            https_port: env_parse("HTTPS_PORT", 8443)?,
            smtp_port: env_parse("SMTP_LISTEN_PORT", 2525)?,
            bind_ip: env_str("BIND_IP", "0.0.0.0"),
            base_url: env_str("BASE_URL", "example.com"),
            wildcard_host: env_str("WILDCARD_HOST", "*.example.com"),
            shell_addr: env_str("SANDSTORM_SHELL_ADDR", "127.0.0.1:3000"),
            shell_smtp_addr: env_str("SANDSTORM_SHELL_SMTP_ADDR", "127.0.0.1:25"),
            backend_socket_path: env_str(
                "SANDSTORM_BACKEND_SOCKET_PATH",
                data_root.join("socket").join("backend").to_str().unwrap_or_default(),
            )
            .into(),
            data_root,
            session_purge_interval: Duration::from_secs(env_parse(
                "SANDSTORM_SESSION_PURGE_INTERVAL_SECS",
                120,
            )?),
            session_idle_timeout: Duration::from_secs(env_parse(
                "SANDSTORM_SESSION_IDLE_TIMEOUT_SECS",
                120,
            )?),
            foreign_hostname_unknown_ttl: Duration::from_secs(env_parse(
                "SANDSTORM_FOREIGN_HOSTNAME_UNKNOWN_TTL_SECS",
                300,
            )?),
            tls_cert_path: std::env::var("SANDSTORM_TLS_CERT_PATH").ok().map(PathBuf::from),
            tls_key_path: std::env::var("SANDSTORM_TLS_KEY_PATH").ok().map(PathBuf::from),
        })
    }

    pub fn grains_dir(&self) -> PathBuf {
        self.data_root.join("grains")
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
