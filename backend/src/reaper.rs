//! `SubprocessSet`-equivalent: reaps every child the backend forks directly
//! (backup/restore helpers, package-install unpack helpers) by listening for
//! `SIGCHLD` and draining exited pids with a non-blocking `waitpid` loop,
//! rather than awaiting each `Child` handle individually — grounded on
//! `original_source/src/sandstorm/supervisor-main.c++`'s `SubprocessSet`,
//! which centralises reaping so a crashed helper can't leave a zombie behind
//! even if nothing is currently awaiting it.

use std::collections::HashMap;
use std::sync::Arc;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::{oneshot, Mutex};
use tracing::warn;

pub struct Reaper {
    waiters: Arc<Mutex<HashMap<i32, oneshot::Sender<ExitStatus>>>>,
}

#[derive(Debug, Clone, Copy)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl Reaper {
    /// Installs a `SIGCHLD` handler and starts the background reaping task.
    /// Must be called once per process before any `watch` call.
    pub fn install() -> Arc<Self> {
        unsafe {
            let _ = signal(Signal::SIGCHLD, SigHandler::SigDfl);
        }
        let reaper = Arc::new(Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        });
        let waiters = Arc::clone(&reaper.waiters);
        tokio::spawn(Self::run(waiters));
        reaper
    }

    async fn run(waiters: Arc<Mutex<HashMap<i32, oneshot::Sender<ExitStatus>>>>) {
        let mut signals = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child())
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGCHLD listener");
                return;
            }
        };
        loop {
            signals.recv().await;
            loop {
                match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(pid, code)) => {
                        Self::notify(&waiters, pid.as_raw(), ExitStatus::Exited(code)).await;
                    }
                    Ok(WaitStatus::Signaled(pid, sig, _)) => {
                        Self::notify(&waiters, pid.as_raw(), ExitStatus::Signaled(sig as i32))
                            .await;
                    }
                    Ok(WaitStatus::StillAlive) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    async fn notify(
        waiters: &Arc<Mutex<HashMap<i32, oneshot::Sender<ExitStatus>>>>,
        pid: i32,
        status: ExitStatus,
    ) {
        if let Some(tx) = waiters.lock().await.remove(&pid) {
            let _ = tx.send(status);
        }
    }

    /// Registers interest in a pid's exit, returning a future that resolves
    /// once the reaping loop observes it via `SIGCHLD`.
    pub async fn watch(&self, pid: Pid) -> oneshot::Receiver<ExitStatus> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(pid.as_raw(), tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watch_resolves_when_child_exits() {
        let reaper = Reaper::install();
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let rx = reaper.watch(pid).await;
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("reaper should observe exit within timeout")
            .expect("sender not dropped");
        assert!(matches!(status, ExitStatus::Exited(0)));
    }
}
