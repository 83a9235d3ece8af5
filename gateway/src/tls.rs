//! `GatewayTlsManager`: holds the HTTPS/SMTPS cert chain and key, reloaded
//! from disk on demand, with a generation counter so listeners can detect a
//! rotation (SPEC_FULL.md §3's "GatewayTlsManager state").

use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

#[derive(Clone)]
struct Loaded {
    acceptor: TlsAcceptor,
    generation: u64,
}

/// Owns the current TLS material and publishes it to listeners via a
/// `watch` channel so the HTTPS/SMTPS accept loops can block on the first
/// key being provided and pick up later rotations without restarting.
pub struct GatewayTlsManager {
    tx: watch::Sender<Option<Loaded>>,
}

impl GatewayTlsManager {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(None);
        Arc::new(Self { tx })
    }

    /// Loads a PEM cert chain and key from disk and publishes them,
    /// bumping the generation counter.
    pub fn load_from_files(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        let generation = self.tx.borrow().as_ref().map(|l| l.generation + 1).unwrap_or(0);
        let loaded = Loaded {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            generation,
        };
        info!(generation, "gateway TLS material (re)loaded");
        self.tx.send_replace(Some(loaded));
        Ok(())
    }

    /// Resolves once a cert has been loaded at least once.
    pub async fn ready_acceptor(&self) -> TlsAcceptor {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(loaded) = rx.borrow().clone() {
                return loaded.acceptor;
            }
            if rx.changed().await.is_err() {
                // Sender dropped — manager outlives every subscriber in
                // practice, so this only happens during shutdown.
                std::future::pending::<()>().await;
            }
        }
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse cert chain {}: {e}", path.display()))
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_acceptor_blocks_until_loaded() {
        let manager = GatewayTlsManager::new();
        let waited = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let waited2 = Arc::clone(&waited);
        let mgr2 = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            mgr2.ready_acceptor().await;
            waited2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waited.load(std::sync::atomic::Ordering::SeqCst));

        // A well-formed self-signed pair would be needed to actually
        // complete the load; here we only assert the pre-load block holds,
        // which is the property this type exists for.
        handle.abort();
    }
}
