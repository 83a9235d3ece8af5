//! In-memory grain registry: `startGrain`/`getGrain`/`deleteGrain`/
//! `transferGrain` (spec.md §4.2). Grounded directly on the teacher's
//! `hypervisor/src/sandbox/mod.rs::SandboxRegistry` — a `Mutex`-guarded
//! `HashMap` of entries, a `ForkedPromise`-shaped dedup on concurrent
//! start, a background process handle kept alongside the entry. The
//! teacher keys by `(user_id, role)`; this keys by grain id, and a second
//! call for a grain already starting waits on the same in-flight future
//! instead of launching a duplicate supervisor (spec.md §4.2 "Concurrency").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::error::Error;
use shared_types::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrainStatus {
    Starting,
    Running,
    Stopped,
}

pub struct GrainEntry {
    pub status: GrainStatus,
    pub child: Option<Child>,
    pub rpc_socket_path: PathBuf,
    /// Fired once when a `Starting` entry transitions to `Running` or is
    /// dropped on failure, so concurrent `startGrain` callers can wait on it.
    start_done: Arc<Notify>,
}

pub struct GrainRegistry {
    entries: Mutex<HashMap<String, GrainEntry>>,
    grains_dir: PathBuf,
}

pub enum StartOutcome {
    /// This call actually launched the grain.
    Started { rpc_socket_path: PathBuf },
    /// Another in-flight call launched it; this call waited and reused it.
    Joined { rpc_socket_path: PathBuf },
}

impl GrainRegistry {
    pub fn new(grains_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            grains_dir,
        })
    }

    /// `startGrain` (spec.md §4.2). `spawn` does the actual fork/exec and is
    /// only invoked by the caller that wins the race to create the entry.
    pub async fn start_grain<F, Fut>(
        self: &Arc<Self>,
        grain_id: &str,
        spawn: F,
    ) -> Result<StartOutcome, Error>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<Child, Error>>,
    {
        let rpc_socket_path = self.grains_dir.join(grain_id).join("rpc.sock");

        let notify = {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get(grain_id) {
                match entry.status {
                    GrainStatus::Running => {
                        return Ok(StartOutcome::Joined {
                            rpc_socket_path: entry.rpc_socket_path.clone(),
                        })
                    }
                    GrainStatus::Starting => Some(Arc::clone(&entry.start_done)),
                    GrainStatus::Stopped => None,
                }
            } else {
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            let entries = self.entries.lock().await;
            return match entries.get(grain_id) {
                Some(entry) if entry.status == GrainStatus::Running => Ok(StartOutcome::Joined {
                    rpc_socket_path: entry.rpc_socket_path.clone(),
                }),
                _ => Err(Error::Spawn(format!(
                    "grain {grain_id} failed to start (observed by a waiting caller)"
                ))),
            };
        }

        let start_done = Arc::new(Notify::new());
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                grain_id.to_string(),
                GrainEntry {
                    status: GrainStatus::Starting,
                    child: None,
                    rpc_socket_path: rpc_socket_path.clone(),
                    start_done: Arc::clone(&start_done),
                },
            );
        }

        tokio::fs::create_dir_all(self.grains_dir.join(grain_id)).await?;

        let result = spawn(rpc_socket_path.clone()).await;
        let mut entries = self.entries.lock().await;
        match result {
            Ok(child) => {
                entries.insert(
                    grain_id.to_string(),
                    GrainEntry {
                        status: GrainStatus::Running,
                        child: Some(child),
                        rpc_socket_path: rpc_socket_path.clone(),
                        start_done,
                    },
                );
                info!(grain_id, "grain started");
                entries
                    .get(grain_id)
                    .unwrap()
                    .start_done
                    .notify_waiters();
                Ok(StartOutcome::Started { rpc_socket_path })
            }
            Err(e) => {
                entries.remove(grain_id);
                start_done.notify_waiters();
                warn!(grain_id, error = %e, "grain start failed");
                Err(e)
            }
        }
    }

    pub async fn get_grain(&self, grain_id: &str) -> Result<PathBuf, Error> {
        let entries = self.entries.lock().await;
        match entries.get(grain_id) {
            Some(entry) if entry.status == GrainStatus::Running => {
                Ok(entry.rpc_socket_path.clone())
            }
            _ => Err(Error::GrainNotFound(grain_id.to_string())),
        }
    }

    pub async fn delete_grain(&self, grain_id: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;
        if let Some(mut entry) = entries.remove(grain_id) {
            if let Some(child) = entry.child.as_mut() {
                let _ = child.kill().await;
            }
        }
        tokio::fs::remove_dir_all(self.grains_dir.join(grain_id))
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        Ok(())
    }

    /// `transferGrain`: move a grain's on-disk state to a new id (e.g. moving
    /// ownership between users), refusing if the source is still running.
    pub async fn transfer_grain(&self, from_id: &str, to_id: &str) -> Result<(), Error> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(from_id) {
            if entry.status == GrainStatus::Running {
                return Err(Error::InputInvalid(
                    "cannot transfer a running grain".to_string(),
                ));
            }
        }
        tokio::fs::rename(
            self.grains_dir.join(from_id),
            self.grains_dir.join(to_id),
        )
        .await?;
        if let Some(entry) = entries.remove(from_id) {
            entries.insert(to_id.to_string(), entry);
        }
        Ok(())
    }
}

/// Resolves the manifest's main command into argv/env ready for the
/// supervisor's own `Config::from_env` to pick up (set as child env vars
/// rather than argv, matching spec.md §6's run-bundle environment-variable
/// surface).
pub fn command_env_vars(command: &Command) -> Vec<(String, String)> {
    command.env.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_concurrent_start_joins_first() {
        let dir = tempfile::tempdir().unwrap();
        let registry = GrainRegistry::new(dir.path().to_path_buf());

        let r1 = Arc::clone(&registry);
        let started = Arc::new(tokio::sync::Notify::new());
        let started2 = Arc::clone(&started);
        let first = tokio::spawn(async move {
            r1.start_grain("g1", move |_path| async move {
                started2.notify_waiters();
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                // A real spawn call launches tokio::process::Command; tests
                // don't need a real child, just a handle, so spawn a no-op
                // process guaranteed to exist on Linux test runners.
                tokio::process::Command::new("true")
                    .spawn()
                    .map_err(Error::Io)
            })
            .await
        });

        started.notified().await;
        let r2 = Arc::clone(&registry);
        let second = r2
            .start_grain("g1", |_path| async move {
                Err(Error::Spawn("should not be called".into()))
            })
            .await
            .unwrap();
        assert!(matches!(second, StartOutcome::Joined { .. }));

        let first_outcome = first.await.unwrap().unwrap();
        assert!(matches!(first_outcome, StartOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn get_grain_not_found_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let registry = GrainRegistry::new(dir.path().to_path_buf());
        let err = registry.get_grain("missing").await.unwrap_err();
        assert!(matches!(err, Error::GrainNotFound(_)));
    }

    #[tokio::test]
    async fn delete_grain_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = GrainRegistry::new(dir.path().to_path_buf());
        tokio::fs::create_dir_all(dir.path().join("g1")).await.unwrap();
        registry.delete_grain("g1").await.unwrap();
        assert!(!dir.path().join("g1").exists());
    }
}
