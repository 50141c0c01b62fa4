//! TLS acceptor for inbound client connections.
//!
//! The proxy acts as a TLS server toward clients, presenting the configured
//! certificate and optionally requiring a client certificate. When client
//! auth is enabled the peer chain is captured after the handshake so the
//! certificate authority can impersonate the client toward the backend.

use std::path::Path;
use std::sync::Arc;

use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::debug;

use crate::config::UpstreamTlsConfig;
use crate::error::{TlsError, TlsResult};

use super::{ensure_crypto_provider, load_certificates, load_private_key};

/// TLS acceptor for inbound connections from clients.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TokioTlsAcceptor,
}

impl TlsServerAcceptor {
    /// Create a new TLS acceptor from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Server certificate or key files cannot be loaded
    /// - CA certificate for client verification cannot be loaded
    /// - TLS configuration is invalid
    pub fn new(config: &UpstreamTlsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let server_config = build_server_config(config)?;
        Ok(Self {
            inner: TokioTlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Accept a TLS connection from a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails. Handshake failures are
    /// reported, not retried; the client owns any retry policy.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        debug!("accepting TLS connection from client");

        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// Build a rustls `ServerConfig` from our configuration.
fn build_server_config(config: &UpstreamTlsConfig) -> TlsResult<ServerConfig> {
    let certs = load_certificates(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let builder = ServerConfig::builder();

    let server_config = if config.require_client_cert {
        // mTLS mode: require and verify client certificates
        let ca_path = config.ca_cert_path.as_ref().ok_or_else(|| {
            TlsError::Config(
                "CA certificate path required when require_client_cert is true".to_string(),
            )
        })?;

        debug!(ca_path = %ca_path.display(), "configuring mTLS with client certificate verification");

        let client_cert_verifier = build_client_verifier(ca_path, false)?;

        builder
            .with_client_cert_verifier(client_cert_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?
    } else if let Some(ca_path) = &config.ca_cert_path {
        // Optional client cert: verify if provided
        debug!(ca_path = %ca_path.display(), "configuring optional client certificate verification");

        let client_cert_verifier = build_client_verifier(ca_path, true)?;

        builder
            .with_client_cert_verifier(client_cert_verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?
    } else {
        // No client certificate verification
        debug!("configuring TLS without client certificate verification");

        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?
    };

    Ok(server_config)
}

/// Build a client certificate verifier rooted at the given CA bundle.
fn build_client_verifier(
    ca_path: &Path,
    allow_unauthenticated: bool,
) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    let mut root_store = RootCertStore::empty();
    let certs = load_certificates(ca_path)?;
    let (added, _ignored) = root_store.add_parsable_certificates(certs);
    debug!(added, "added CA certificates to client verification store");

    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }

    let builder = WebPkiClientVerifier::builder(Arc::new(root_store));
    let builder = if allow_unauthenticated {
        builder.allow_unauthenticated()
    } else {
        builder
    };

    builder
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_material::{self_signed, write_temp};
    use std::path::PathBuf;

    fn config(
        cert: &tempfile::NamedTempFile,
        key: &tempfile::NamedTempFile,
        ca: Option<&tempfile::NamedTempFile>,
        require_client_cert: bool,
    ) -> UpstreamTlsConfig {
        UpstreamTlsConfig {
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
            ca_cert_path: ca.map(|f| f.path().to_path_buf()),
            require_client_cert,
        }
    }

    #[test]
    fn test_acceptor_without_client_auth() {
        let (cert_pem, key_pem) = self_signed("upstream");
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);

        let acceptor = TlsServerAcceptor::new(&config(&cert, &key, None, false));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_with_required_client_auth() {
        let (cert_pem, key_pem) = self_signed("upstream");
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);
        let (ca_pem, _) = self_signed("client-ca");
        let ca = write_temp(&ca_pem);

        let acceptor = TlsServerAcceptor::new(&config(&cert, &key, Some(&ca), true));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_with_optional_client_auth() {
        let (cert_pem, key_pem) = self_signed("upstream");
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);
        let (ca_pem, _) = self_signed("client-ca");
        let ca = write_temp(&ca_pem);

        let acceptor = TlsServerAcceptor::new(&config(&cert, &key, Some(&ca), false));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_missing_ca_for_mtls() {
        let (cert_pem, key_pem) = self_signed("upstream");
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);

        let acceptor = TlsServerAcceptor::new(&config(&cert, &key, None, true));
        assert!(acceptor.is_err());
    }

    #[test]
    fn test_acceptor_missing_cert() {
        let (_, key_pem) = self_signed("upstream");
        let key = write_temp(&key_pem);

        let config = UpstreamTlsConfig {
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: key.path().to_path_buf(),
            ca_cert_path: None,
            require_client_cert: false,
        };
        assert!(TlsServerAcceptor::new(&config).is_err());
    }
}
