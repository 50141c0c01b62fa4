//! TLS connector for outbound backend connections.
//!
//! The proxy acts as a TLS client toward the real nodes. Unlike the
//! upstream acceptor, the connector is built per downstream dial: the
//! client identity it presents may be a freshly minted impostor
//! certificate, which only exists once the upstream peer is known.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::{debug, warn};

use crate::ca::DownstreamIdentity;
use crate::config::DownstreamTlsConfig;
use crate::error::{TlsError, TlsResult};

use super::{ensure_crypto_provider, load_certificates};

/// TLS connector for outbound connections to backend nodes.
#[derive(Clone)]
pub struct TlsClientConnector {
    inner: TokioTlsConnector,
}

impl TlsClientConnector {
    /// Create a connector for one downstream dial.
    ///
    /// # Arguments
    ///
    /// * `config` - Trust configuration for the backend connection
    /// * `identity` - Optional client identity (static or impostor) to
    ///   present during the handshake
    ///
    /// # Errors
    ///
    /// Returns an error if trust material cannot be loaded or the identity
    /// is rejected by rustls.
    pub fn new(
        config: &DownstreamTlsConfig,
        identity: Option<&DownstreamIdentity>,
    ) -> TlsResult<Self> {
        ensure_crypto_provider();
        let client_config = build_client_config(config, identity)?;
        Ok(Self {
            inner: TokioTlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Connect to a backend node over TLS.
    ///
    /// # Arguments
    ///
    /// * `server_name` - The hostname for SNI and certificate verification
    /// * `stream` - The underlying TCP stream to wrap
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> TlsResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name: {e}")))?;

        debug!("initiating TLS handshake with backend");

        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

/// Build a rustls `ClientConfig` from our configuration.
fn build_client_config(
    config: &DownstreamTlsConfig,
    identity: Option<&DownstreamIdentity>,
) -> TlsResult<ClientConfig> {
    let builder = if config.verify_hostname {
        let root_store = build_root_store(config)?;
        ClientConfig::builder().with_root_certificates(root_store)
    } else {
        warn!("backend certificate verification disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
    };

    let client_config = match identity {
        Some(identity) => {
            debug!("presenting client certificate to backend");
            builder
                .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
                .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(client_config)
}

/// Build the root certificate store.
fn build_root_store(config: &DownstreamTlsConfig) -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    if let Some(ca_path) = &config.ca_cert_path {
        // Load custom CA certificate
        debug!(path = %ca_path.display(), "loading custom CA certificate");
        let certs = load_certificates(ca_path)?;
        let (added, _ignored) = root_store.add_parsable_certificates(certs);
        debug!(added, "added CA certificates to trust store");

        if added == 0 {
            return Err(TlsError::NoCertificates(ca_path.display().to_string()));
        }
    } else {
        // Use webpki roots (Mozilla's root certificates)
        debug!("using system root certificates");
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(root_store)
}

/// Certificate verifier that accepts any backend certificate.
///
/// Used only when `verify_hostname` is disabled. Signatures are still
/// checked so a broken handshake fails loudly rather than silently.
#[derive(Debug)]
struct NoVerification {
    provider: CryptoProvider,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
