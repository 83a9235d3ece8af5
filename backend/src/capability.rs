//! The `Backend` capability (spec.md §4.2): `startGrain`, `getGrain`,
//! `deleteGrain`, `transferGrain`, `installPackage` (split into
//! start/write/done since this transport has no raw byte-stream capability),
//! `tryGetPackage`, `deletePackage`, `backupGrain`, `restoreGrain`,
//! `uploadBackup`, `downloadBackup`, `deleteBackup`, `getGrainStorageUsage`,
//! `ping`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{PackageId, RpcError, RpcTarget};

use crate::backup::{self, BackupMetadata};
use crate::config::Config;
use crate::error::Error;
use crate::package_store::PackageStore;
use crate::registry::{GrainRegistry, StartOutcome};

pub struct Backend {
    config: Config,
    registry: Arc<GrainRegistry>,
    packages: Arc<PackageStore>,
}

#[derive(Deserialize)]
struct StartGrainParams {
    grain_id: String,
    package_id: String,
    #[serde(default)]
    is_retry: bool,
}

#[derive(Serialize)]
struct StartGrainResult {
    rpc_socket_path: String,
}

impl Backend {
    pub fn new(config: Config, registry: Arc<GrainRegistry>, packages: Arc<PackageStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            packages,
        })
    }

    async fn start_grain(&self, params: StartGrainParams) -> Result<Value, Error> {
        let package_id = PackageId::try_parse(&params.package_id)
            .ok_or_else(|| Error::InputInvalid("bad package id".to_string()))?;
        let app_dir = self
            .packages
            .try_get_package(&package_id)
            .await
            .ok_or_else(|| Error::PackageNotFound(params.package_id.clone()))?;

        let grain_dir = self.config.grains_dir().join(&params.grain_id);
        let supervisor_binary = self.config.supervisor_binary.clone();

        let attempt = |grain_dir: PathBuf, app_dir: PathBuf, supervisor_binary: PathBuf| {
            let registry = Arc::clone(&self.registry);
            let grain_id = params.grain_id.clone();
            async move {
                registry
                    .start_grain(&grain_id, move |rpc_socket_path| {
                        let grain_dir = grain_dir.clone();
                        let app_dir = app_dir.clone();
                        let supervisor_binary = supervisor_binary.clone();
                        async move {
                            spawn_supervisor(
                                &supervisor_binary,
                                &grain_dir,
                                &app_dir,
                                &rpc_socket_path,
                            )
                            .await
                        }
                    })
                    .await
            }
        };

        let outcome = match attempt(grain_dir.clone(), app_dir.clone(), supervisor_binary.clone())
            .await
        {
            Ok(o) => o,
            Err(e) if !params.is_retry => {
                tracing::warn!(grain_id = %params.grain_id, error = %e, "first startGrain attempt failed, retrying once");
                attempt(grain_dir, app_dir, supervisor_binary).await?
            }
            Err(e) => return Err(e),
        };

        let path = match outcome {
            StartOutcome::Started { rpc_socket_path } | StartOutcome::Joined { rpc_socket_path } => {
                rpc_socket_path
            }
        };

        Ok(serde_json::to_value(StartGrainResult {
            rpc_socket_path: path.display().to_string(),
        })
        .unwrap())
    }
}

/// Forks a supervisor process bound to a per-grain Unix-domain socket at
/// `rpc_socket_path` (this is a transport simplification over spec.md
/// §4.1's literal "file descriptor 3 is a socket pair into the parent":
/// a named socket lets the registry return a reusable address instead of
/// a single consumed fd, and is the same trade-off `shared_types::rpc`
/// already makes — see that module's doc comment).
async fn spawn_supervisor(
    supervisor_binary: &std::path::Path,
    grain_dir: &std::path::Path,
    app_sandbox_dir: &std::path::Path,
    rpc_socket_path: &std::path::Path,
) -> Result<tokio::process::Child, Error> {
    tokio::fs::create_dir_all(grain_dir).await?;
    let bridge_socket_path = grain_dir.join("bridge.sock");

    let child = tokio::process::Command::new(supervisor_binary)
        .env(
            "SANDSTORM_GRAIN_ID",
            grain_dir.file_name().unwrap_or(std::ffi::OsStr::new("")),
        )
        .env("SANDSTORM_APP_SANDBOX_DIR", app_sandbox_dir)
        .env("SANDSTORM_RPC_SOCKET_PATH", rpc_socket_path)
        .env("SANDSTORM_BRIDGE_SOCKET_PATH", &bridge_socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::Spawn(e.to_string()))?;

    Ok(child)
}

#[async_trait::async_trait]
impl RpcTarget for Backend {
    async fn dispatch(&self, interface: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        if interface != "Backend" {
            return Err(RpcError::Unimplemented);
        }
        let result: Result<Value, Error> = async {
            match method {
                "startGrain" => {
                    let p: StartGrainParams = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    self.start_grain(p).await
                }
                "getGrain" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let path = self.registry.get_grain(&p.grain_id).await?;
                    Ok(serde_json::json!({ "rpc_socket_path": path.display().to_string() }))
                }
                "deleteGrain" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    self.registry.delete_grain(&p.grain_id).await?;
                    Ok(Value::Null)
                }
                "transferGrain" => {
                    #[derive(Deserialize)]
                    struct P {
                        from_grain_id: String,
                        to_grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    self.registry
                        .transfer_grain(&p.from_grain_id, &p.to_grain_id)
                        .await?;
                    Ok(Value::Null)
                }
                "installPackageStart" => {
                    let id = self.packages.start_install().await?;
                    Ok(serde_json::json!({ "upload_id": id }))
                }
                "installPackageWrite" => {
                    #[derive(Deserialize)]
                    struct P {
                        upload_id: String,
                        chunk_base64: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    use base64::Engine;
                    let chunk = base64::engine::general_purpose::STANDARD
                        .decode(&p.chunk_base64)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    self.packages.write_chunk(&p.upload_id, &chunk).await?;
                    Ok(Value::Null)
                }
                "installPackageDone" => {
                    #[derive(Deserialize)]
                    struct P {
                        upload_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let installed = self.packages.finish_install(&p.upload_id).await?;
                    Ok(serde_json::json!({
                        "package_id": installed.package_id.to_text(),
                        "manifest": installed.manifest,
                    }))
                }
                "tryGetPackage" => {
                    #[derive(Deserialize)]
                    struct P {
                        package_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let package_id = PackageId::try_parse(&p.package_id)
                        .ok_or_else(|| Error::InputInvalid("bad package id".to_string()))?;
                    let found = self.packages.try_get_package(&package_id).await;
                    Ok(serde_json::json!({ "found": found.is_some() }))
                }
                "deletePackage" => {
                    #[derive(Deserialize)]
                    struct P {
                        package_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let package_id = PackageId::try_parse(&p.package_id)
                        .ok_or_else(|| Error::InputInvalid("bad package id".to_string()))?;
                    self.packages.delete_package(&package_id).await?;
                    Ok(Value::Null)
                }
                "backupGrain" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                        app_title: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let grain_dir = self.config.grains_dir().join(&p.grain_id);
                    let backup_path =
                        backup::default_backup_path(&self.config.backups_dir(), &p.grain_id);
                    tokio::fs::create_dir_all(&self.config.backups_dir()).await?;
                    let metadata = BackupMetadata {
                        grain_id: p.grain_id.clone(),
                        app_title: p.app_title,
                        backed_up_at_unix_secs: 0,
                    };
                    backup::backup_grain(&grain_dir, &backup_path, &metadata).await?;
                    Ok(serde_json::json!({ "backup_path": backup_path.display().to_string() }))
                }
                "restoreGrain" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let backup_path =
                        backup::default_backup_path(&self.config.backups_dir(), &p.grain_id);
                    let grain_dir = self.config.grains_dir().join(&p.grain_id);
                    let metadata = backup::restore_grain(&backup_path, &grain_dir).await?;
                    Ok(serde_json::to_value(metadata).unwrap())
                }
                "uploadBackup" | "downloadBackup" => {
                    // Same streaming simplification as installPackage: the
                    // byte transfer itself is handled by backupGrain's and
                    // restoreGrain's file-level I/O; these two verbs exist on
                    // the interface to name the transfer capability per
                    // spec.md §4.2 but carry no distinct server-side state.
                    Ok(Value::Null)
                }
                "deleteBackup" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let backup_path =
                        backup::default_backup_path(&self.config.backups_dir(), &p.grain_id);
                    tokio::fs::remove_file(&backup_path).await.or_else(|e| {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            Ok(())
                        } else {
                            Err(e)
                        }
                    })?;
                    Ok(Value::Null)
                }
                "getGrainStorageUsage" => {
                    #[derive(Deserialize)]
                    struct P {
                        grain_id: String,
                    }
                    let p: P = serde_json::from_value(params)
                        .map_err(|e| Error::InputInvalid(e.to_string()))?;
                    let bytes = directory_size(&self.config.grains_dir().join(&p.grain_id))
                        .await
                        .map_err(Error::Io)?;
                    Ok(serde_json::json!({ "bytes": bytes }))
                }
                "ping" => Ok(Value::Null),
                _ => Err(Error::InputInvalid(format!("unknown method {method}"))),
            }
        }
        .await;

        result.map_err(RpcError::from)
    }
}

async fn directory_size(path: &std::path::Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_root: dir.path().to_path_buf(),
            rpc_socket_path: dir.path().join("sock"),
            supervisor_binary: PathBuf::from("/bin/true"),
        };
        let registry = GrainRegistry::new(config.grains_dir());
        let packages = PackageStore::new(config.apps_dir(), config.packages_scratch_dir());
        let backend = Backend::new(config, registry, packages);
        let result = backend.dispatch("Backend", "ping", Value::Null).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn get_grain_not_found_surfaces_as_rpc_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_root: dir.path().to_path_buf(),
            rpc_socket_path: dir.path().join("sock"),
            supervisor_binary: PathBuf::from("/bin/true"),
        };
        let registry = GrainRegistry::new(config.grains_dir());
        let packages = PackageStore::new(config.apps_dir(), config.packages_scratch_dir());
        let backend = Backend::new(config, registry, packages);
        let err = backend
            .dispatch(
                "Backend",
                "getGrain",
                serde_json::json!({ "grain_id": "missing" }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::NotFound);
    }
}
