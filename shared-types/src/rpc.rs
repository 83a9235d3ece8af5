//! The capability-RPC transport assumed by spec.md §9.
//!
//! Upstream Sandstorm speaks a two-party cap'n-proto session with promise
//! pipelining and capability passing. No cap'n-proto-equivalent crate
//! appears anywhere in the retrieval pack, so this implementation adapts
//! the closest real idiom present in it: a newline-delimited JSON
//! request/response protocol over a Unix-domain socket, with call-id
//! correlation standing in for pipelining and a `RpcTarget` trait standing
//! in for "a capability". `CapRedirector` (spec.md §4.5) and membranes
//! (spec.md §9) are expressed as adapters over `RpcTarget` rather than a
//! code-generated interface.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex, Notify};

/// Error kinds from spec.md §7, independent of any particular transport.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcError {
    #[error("disconnected")]
    Disconnected,
    #[error("unimplemented")]
    Unimplemented,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InputInvalid(String),
    #[error("fatal i/o error: {0}")]
    IoFatal(String),
}

/// One dispatch envelope: `(interfaceId, methodId, params)` per spec.md §9,
/// plus the call id used to match a response back to its caller.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub interface: String,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Result<serde_json::Value, RpcError>,
}

/// A capability: something that can receive a dispatch envelope and
/// produce a result. Implemented by the in-process `Supervisor`/`Backend`
/// servers and by membranes that wrap another `RpcTarget`.
#[async_trait::async_trait]
pub trait RpcTarget: Send + Sync {
    async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;
}

/// A membrane rewrites dispatch envelopes before forwarding them to an
/// inner target — e.g. redirecting `getResponse` on a `RequestStream`
/// membrane while passing every other byte-stream method straight through
/// (spec.md §4.4's "streaming upload request/response duality").
#[async_trait::async_trait]
pub trait Membrane: Send + Sync {
    async fn rewrite(
        &self,
        interface: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(String, String, serde_json::Value), RpcError>;
}

pub struct MembraneWrapped<T: RpcTarget> {
    inner: Arc<T>,
    membrane: Arc<dyn Membrane>,
}

impl<T: RpcTarget> MembraneWrapped<T> {
    pub fn new(inner: Arc<T>, membrane: Arc<dyn Membrane>) -> Self {
        Self { inner, membrane }
    }
}

#[async_trait::async_trait]
impl<T: RpcTarget> RpcTarget for MembraneWrapped<T> {
    async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let (interface, method, params) = self.membrane.rewrite(interface, method, params).await?;
        self.inner.dispatch(&interface, &method, params).await
    }
}

/// A reference-counted capability wrapper used where the front end may
/// transiently disconnect (spec.md §4.5). Each inbound call is forwarded to
/// the current target; on disconnect, `invalidate` replaces the target with
/// an unresolved slot and subsequent calls queue until `set_target` is
/// called again. `generation` lets callers detect a stale `set_target` that
/// arrives after a newer one already replaced it.
pub struct CapRedirector<T> {
    inner: Mutex<Slot<T>>,
    ready: Notify,
}

struct Slot<T> {
    target: Option<Arc<T>>,
    generation: u64,
}

impl<T: Send + Sync + 'static> CapRedirector<T> {
    pub fn new(initial: Arc<T>) -> Self {
        Self {
            inner: Mutex::new(Slot {
                target: Some(initial),
                generation: 0,
            }),
            ready: Notify::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Slot {
                target: None,
                generation: 0,
            }),
            ready: Notify::new(),
        }
    }

    /// Installs a new target, returning the new generation number.
    pub async fn set_target(&self, target: Arc<T>) -> u64 {
        let mut slot = self.inner.lock().await;
        slot.target = Some(target);
        slot.generation += 1;
        let gen = slot.generation;
        drop(slot);
        self.ready.notify_waiters();
        gen
    }

    /// Called on disconnect: clears the current target so new calls queue.
    pub async fn invalidate(&self, expected_generation: u64) {
        let mut slot = self.inner.lock().await;
        if slot.generation == expected_generation {
            slot.target = None;
        }
    }

    /// Waits for a target to be present, then returns it along with the
    /// generation it was set at.
    pub async fn current(&self) -> (Arc<T>, u64) {
        loop {
            {
                let slot = self.inner.lock().await;
                if let Some(target) = &slot.target {
                    return (Arc::clone(target), slot.generation);
                }
            }
            self.ready.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl<T: RpcTarget + 'static> RpcTarget for CapRedirector<T> {
    async fn dispatch(
        &self,
        interface: &str,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let (target, generation) = self.current().await;
        match target.dispatch(interface, method, params).await {
            Err(RpcError::Disconnected) => {
                self.invalidate(generation).await;
                Err(RpcError::Disconnected)
            }
            other => other,
        }
    }
}

/// Client side of the newline-delimited JSON transport: serialises calls,
/// writes them as one line, and correlates responses read from a background
/// reader task back to the caller via `id`.
pub struct RpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl RpcClient {
    pub fn new(read_half: OwnedReadHalf, write_half: OwnedWriteHalf) -> Arc<Self> {
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let client = Arc::new(Self {
            writer: Mutex::new(write_half),
            pending: Arc::clone(&pending),
            next_id: std::sync::atomic::AtomicU64::new(1),
        });
        tokio::spawn(Self::read_loop(read_half, pending));
        client
    }

    async fn read_loop(
        read_half: OwnedReadHalf,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
    ) {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Ok(resp) = serde_json::from_str::<RpcResponse>(&line) {
                        if let Some(tx) = pending.lock().await.remove(&resp.id) {
                            let _ = tx.send(resp);
                        }
                    }
                }
                _ => {
                    // Connection closed: wake every still-pending caller with
                    // a disconnected error rather than letting them hang.
                    let mut pending = pending.lock().await;
                    for (_, tx) in pending.drain() {
                        let _ = tx.send(RpcResponse {
                            id: 0,
                            result: Err(RpcError::Disconnected),
                        });
                    }
                    return;
                }
            }
        }
    }

    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        interface: &str,
        method: &str,
        params: &P,
    ) -> Result<R, RpcError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = RpcRequest {
            id,
            interface: interface.to_string(),
            method: method.to_string(),
            params: serde_json::to_value(params)
                .map_err(|e| RpcError::InputInvalid(e.to_string()))?,
        };
        let mut line =
            serde_json::to_string(&request).map_err(|e| RpcError::InputInvalid(e.to_string()))?;
        line.push('\n');

        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|_| RpcError::Disconnected)?;
        }

        let response = rx.await.map_err(|_| RpcError::Disconnected)?;
        match response.result {
            Ok(value) => serde_json::from_value(value).map_err(|e| RpcError::InputInvalid(e.to_string())),
            Err(e) => Err(e),
        }
    }
}

/// Server side: reads request lines, dispatches to `target`, writes back
/// responses. Runs until the peer disconnects.
pub async fn serve<T: RpcTarget + 'static>(
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    target: Arc<T>,
) {
    let writer = Arc::new(Mutex::new(write_half));
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => return,
        };
        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let target = Arc::clone(&target);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let result = target
                .dispatch(&request.interface, &request.method, request.params)
                .await;
            let response = RpcResponse {
                id: request.id,
                result,
            };
            if let Ok(mut line) = serde_json::to_string(&response) {
                line.push('\n');
                let mut writer = writer.lock().await;
                let _ = writer.write_all(line.as_bytes()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl RpcTarget for Echo {
        async fn dispatch(
            &self,
            _interface: &str,
            _method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, RpcError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn cap_redirector_forwards_to_current_target() {
        let redirector = CapRedirector::new(Arc::new(Echo));
        let result = redirector
            .dispatch("Test", "echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn cap_redirector_queues_calls_until_target_set() {
        let redirector = Arc::new(CapRedirector::<Echo>::empty());
        let r2 = Arc::clone(&redirector);
        let handle = tokio::spawn(async move {
            r2.dispatch("Test", "echo", serde_json::json!(42)).await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        redirector.set_target(Arc::new(Echo)).await;
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn set_target_increments_generation() {
        let redirector = CapRedirector::new(Arc::new(Echo));
        let (_, gen0) = redirector.current().await;
        let gen1 = redirector.set_target(Arc::new(Echo)).await;
        assert!(gen1 > gen0);
    }
}
