//! TLS overlay for client endpoints.
//!
//! The root store is the platform roots plus an optional pinned PEM chain
//! (the rendezvous deployment ships its own chain; pinning it keeps the
//! service talking only to that server).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{info, warn};

#[derive(Clone)]
pub struct TlsParams {
    pub config: Arc<rustls::ClientConfig>,
}

impl TlsParams {
    /// Build a client config from platform roots plus an optional pinned
    /// chain (PEM bytes).
    pub fn new(pinned_chain_pem: Option<&[u8]>) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();

        for cert in rustls_native_certs::load_native_certs()
            .expect("Could not load platform certs")
        {
            let _ = root_store.add(cert);
        }

        if let Some(pem) = pinned_chain_pem {
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut &pem[..]) {
                let cert = cert.context("Invalid PEM in pinned chain")?;
                match root_store.add(cert) {
                    Ok(()) => added += 1,
                    Err(e) => warn!("Failed to add pinned cert to root store: {e}"),
                }
            }
            info!(added, "Pinned server certificate chain");
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

/// Wrap a freshly connected TCP stream. Called again on every reconnect, so
/// the session re-keys transparently.
pub async fn connect(
    tcp: TcpStream,
    host: &str,
    params: &TlsParams,
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::clone(&params.config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .with_context(|| format!("Invalid TLS server name {host}"))?;
    connector
        .connect(server_name, tcp)
        .await
        .context("TLS handshake failed")
}
