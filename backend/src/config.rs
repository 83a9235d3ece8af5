//! Typed configuration, following the teacher's `env_parse`/`env_str`
//! idiom (`hypervisor/src/config.rs`).

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_root: PathBuf,
    pub rpc_socket_path: PathBuf,
    pub supervisor_binary: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let data_root: PathBuf = env_str("SANDSTORM_DATA_ROOT", "/var/sandstorm").into();
        Ok(Self {
            rpc_socket_path: data_root.join("socket").join("backend"),
            supervisor_binary: env_str(
                "SANDSTORM_SUPERVISOR_BINARY",
                "/usr/local/bin/supervisor",
            )
            .into(),
            data_root,
        })
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.data_root.join("apps")
    }
    pub fn grains_dir(&self) -> PathBuf {
        self.data_root.join("grains")
    }
    pub fn packages_scratch_dir(&self) -> PathBuf {
        self.data_root.join("packages")
    }
    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
