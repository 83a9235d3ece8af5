//! The `Supervisor` capability (spec.md §4.1's bootstrap-capability table):
//! `getMainView`, `keepAlive`, `shutdown`, `getGrainSize`, `watchLog`,
//! `syncStorage`.
//!
//! Grounded in the teacher's `hypervisor/src/sandbox/mod.rs` process-registry
//! idiom (an `Arc<Mutex<…>>`-guarded record per running process, methods
//! that touch it under lock and release before awaiting I/O) adapted onto
//! `shared_types::rpc::RpcTarget` instead of an HTTP handler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{RpcError, RpcTarget};
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::logrotate::LogFile;

#[derive(Debug, Serialize, Deserialize)]
pub struct KeepAliveParams {
    /// Serialised `SandstormCore` capability reference the grain rebinds to.
    pub core_ref: Value,
}

#[derive(Debug, Serialize)]
pub struct GrainSize {
    pub bytes: u64,
}

pub struct Supervisor {
    grain_init_pid: Pid,
    log: LogFile,
    grain_dir: PathBuf,
    /// Nanosecond timestamp of the last `keepAlive`, used by the idle-timer
    /// task running alongside this capability (spec.md §4.1 "Idle shutdown").
    last_keepalive_nanos: AtomicI64,
    shutdown_notify: Notify,
    shutdown_grace: std::time::Duration,
}

impl Supervisor {
    pub fn new(
        grain_init_pid: Pid,
        log: LogFile,
        grain_dir: PathBuf,
        shutdown_grace: std::time::Duration,
        now_nanos: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            grain_init_pid,
            log,
            grain_dir,
            last_keepalive_nanos: AtomicI64::new(now_nanos),
            shutdown_notify: Notify::new(),
            shutdown_grace,
        })
    }

    pub fn last_keepalive_nanos(&self) -> i64 {
        self.last_keepalive_nanos.load(Ordering::Relaxed)
    }

    /// Blocks until `shutdown` is called, for the idle-timer task to race
    /// against its own deadline.
    pub async fn wait_for_shutdown_request(&self) {
        self.shutdown_notify.notified().await;
    }

    async fn directory_size(path: &std::path::Path) -> std::io::Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
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

    async fn do_shutdown(&self) -> Result<(), RpcError> {
        self.shutdown_notify.notify_waiters();
        if kill(self.grain_init_pid, Signal::SIGTERM).is_err() {
            return Ok(()); // already gone
        }
        tokio::time::sleep(self.shutdown_grace).await;
        let _ = kill(self.grain_init_pid, Signal::SIGKILL);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RpcTarget for Supervisor {
    async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        if interface != "Supervisor" {
            return Err(RpcError::Unimplemented);
        }
        match method {
            "getMainView" => {
                // The app's UiView capability is reached through a
                // CapRedirector set up by main.rs once the app connects on
                // fd 3; from the RPC surface this just forwards a reference.
                Ok(serde_json::json!({ "capability": "UiView" }))
            }
            "keepAlive" => {
                let _params: KeepAliveParams = serde_json::from_value(params)
                    .map_err(|e| RpcError::InputInvalid(e.to_string()))?;
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                self.last_keepalive_nanos.store(now, Ordering::Relaxed);
                Ok(Value::Null)
            }
            "shutdown" => {
                self.do_shutdown().await?;
                Ok(Value::Null)
            }
            "getGrainSize" => {
                let bytes = Self::directory_size(&self.grain_dir)
                    .await
                    .map_err(|e| RpcError::IoFatal(e.to_string()))?;
                Ok(serde_json::to_value(GrainSize { bytes }).unwrap())
            }
            "watchLog" => {
                let tail = self
                    .log
                    .read_tail(64 * 1024)
                    .map_err(|e| RpcError::IoFatal(e.to_string()))?;
                Ok(Value::String(String::from_utf8_lossy(&tail).into_owned()))
            }
            "syncStorage" => {
                self.log.sync().map_err(|e| RpcError::IoFatal(e.to_string()))?;
                Ok(Value::Null)
            }
            _ => Err(RpcError::Unimplemented),
        }
    }
}

/// Runs until either the idle deadline elapses with no intervening
/// `keepAlive`, or `shutdown` is invoked directly; either way it triggers
/// the SIGTERM/SIGKILL sequence exactly once.
pub async fn run_idle_timer(supervisor: Arc<Supervisor>, idle_timeout: std::time::Duration) {
    loop {
        let last = supervisor.last_keepalive_nanos();
        tokio::select! {
            _ = tokio::time::sleep(idle_timeout) => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                let elapsed = std::time::Duration::from_nanos((now - last).max(0) as u64);
                if elapsed >= idle_timeout {
                    info!("grain idle timeout reached, shutting down");
                    let _ = supervisor.do_shutdown().await;
                    return;
                }
                // A keepAlive landed while we slept; loop and wait out the remainder.
            }
            _ = supervisor.wait_for_shutdown_request() => {
                warn!("supervisor shutdown requested externally, stopping idle timer");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_grain_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 5]).unwrap();

        let log_path = dir.path().join("log");
        let log = LogFile::open(log_path, 1024 * 1024).unwrap();
        let sup = Supervisor::new(
            Pid::this(),
            log,
            dir.path().to_path_buf(),
            std::time::Duration::from_millis(10),
            0,
        );
        let result = sup
            .dispatch("Supervisor", "getGrainSize", Value::Null)
            .await
            .unwrap();
        assert_eq!(result["bytes"], 15);
    }

    #[tokio::test]
    async fn keep_alive_updates_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(dir.path().join("log"), 1024).unwrap();
        let sup = Supervisor::new(
            Pid::this(),
            log,
            dir.path().to_path_buf(),
            std::time::Duration::from_millis(10),
            0,
        );
        sup.dispatch(
            "Supervisor",
            "keepAlive",
            serde_json::json!({ "core_ref": null }),
        )
        .await
        .unwrap();
        assert!(sup.last_keepalive_nanos() > 0);
    }

    #[tokio::test]
    async fn unknown_interface_is_unimplemented() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::open(dir.path().join("log"), 1024).unwrap();
        let sup = Supervisor::new(
            Pid::this(),
            log,
            dir.path().to_path_buf(),
            std::time::Duration::from_millis(10),
            0,
        );
        let err = sup
            .dispatch("OtherIface", "whatever", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Unimplemented);
    }
}
