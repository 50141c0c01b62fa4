//! Downstream identity strategies.
//!
//! When the proxy dials a real node it may present a client certificate.
//! Three interchangeable strategies exist, selected by configuration and
//! modeled as a closed enum:
//!
//! - [`CertificateStrategy::Disabled`]: no client certificate.
//! - [`CertificateStrategy::Static`]: one pre-provisioned identity, loaded
//!   once at startup, used for every downstream connection.
//! - [`CertificateStrategy::Impersonate`]: a fresh impostor certificate per
//!   downstream connection, preserving the upstream peer's subject identity
//!   without ever holding the peer's private key.

mod impersonate;

pub use impersonate::{bootstrap_root, BootstrappedRoot, ImpersonationAuthority};

use std::path::Path;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::CertificateStrategyConfig;
use crate::error::{CaError, CaResult};
use crate::metrics::FacadeMetrics;

/// A client identity the proxy presents toward a backend node.
///
/// Held in memory only, scoped to one downstream connection, and discarded
/// when that connection closes. Never written to persistent storage.
pub struct DownstreamIdentity {
    /// Certificate chain, leaf first.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key matching the leaf certificate.
    pub key: PrivateKeyDer<'static>,
    /// Random password guarding the identity while it is held in memory.
    pub password: String,
}

impl Clone for DownstreamIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
            password: self.password.clone(),
        }
    }
}

impl std::fmt::Debug for DownstreamIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Generate a random password for an in-memory identity.
pub(crate) fn ephemeral_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// One pre-provisioned downstream identity.
pub struct StaticIdentity {
    identity: DownstreamIdentity,
}

impl StaticIdentity {
    /// Load the identity from PEM files once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or key cannot be loaded.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> CaResult<Self> {
        let cert_chain =
            crate::tls::load_certificates(cert_path).map_err(|e| CaError::MaterialLoad {
                path: cert_path.display().to_string(),
                message: e.to_string(),
            })?;
        let key = crate::tls::load_private_key(key_path).map_err(|e| CaError::MaterialLoad {
            path: key_path.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            identity: DownstreamIdentity {
                cert_chain,
                key,
                password: ephemeral_password(),
            },
        })
    }

    /// The identity, shared by every downstream connection.
    #[must_use]
    pub fn identity(&self) -> DownstreamIdentity {
        self.identity.clone()
    }
}

/// The configured downstream identity strategy.
pub enum CertificateStrategy {
    /// Downstream TLS (if any) proceeds without a client certificate.
    Disabled,
    /// One pre-provisioned identity for every downstream connection.
    Static(StaticIdentity),
    /// Mint an impostor certificate per downstream connection.
    Impersonate(ImpersonationAuthority),
}

impl CertificateStrategy {
    /// Build the strategy from configuration, loading key material once.
    ///
    /// # Errors
    ///
    /// Returns an error if required material cannot be loaded; this is
    /// fatal at startup.
    pub fn from_config(
        config: &CertificateStrategyConfig,
        metrics: Arc<FacadeMetrics>,
    ) -> CaResult<Self> {
        match config {
            CertificateStrategyConfig::None => Ok(Self::Disabled),
            CertificateStrategyConfig::Static {
                cert_path,
                key_path,
            } => Ok(Self::Static(StaticIdentity::from_files(
                cert_path, key_path,
            )?)),
            CertificateStrategyConfig::Impersonate {
                ca_cert_path,
                ca_key_path,
                signature_algorithm,
            } => Ok(Self::Impersonate(ImpersonationAuthority::from_files(
                ca_cert_path,
                ca_key_path,
                *signature_algorithm,
                metrics,
            )?)),
        }
    }

    /// Obtain the identity to present on a downstream dial.
    ///
    /// `peer` is the upstream client's certificate, when upstream mTLS
    /// captured one.
    ///
    /// # Errors
    ///
    /// Returns [`CaError::PeerCertificateRequired`] if impersonation is
    /// configured but the upstream handshake supplied no peer certificate,
    /// or a generation error if minting fails.
    pub fn obtain_downstream_identity(
        &self,
        peer: Option<&CertificateDer<'static>>,
    ) -> CaResult<Option<DownstreamIdentity>> {
        match self {
            Self::Disabled => Ok(None),
            Self::Static(static_identity) => Ok(Some(static_identity.identity())),
            Self::Impersonate(authority) => {
                let peer = peer.ok_or(CaError::PeerCertificateRequired)?;
                Ok(Some(authority.impersonate(peer)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_material::{self_signed, write_temp};

    #[test]
    fn test_disabled_strategy_returns_no_identity() {
        let strategy = CertificateStrategy::Disabled;
        assert!(strategy.obtain_downstream_identity(None).unwrap().is_none());
    }

    #[test]
    fn test_static_strategy_ignores_peer() {
        let (cert_pem, key_pem) = self_signed("static-client");
        let cert = write_temp(&cert_pem);
        let key = write_temp(&key_pem);

        let strategy = CertificateStrategy::Static(
            StaticIdentity::from_files(cert.path(), key.path()).unwrap(),
        );

        let identity = strategy.obtain_downstream_identity(None).unwrap().unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
        assert!(!identity.password.is_empty());
    }

    #[test]
    fn test_static_strategy_missing_files() {
        let result = StaticIdentity::from_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(CaError::MaterialLoad { .. })));
    }

    #[test]
    fn test_ephemeral_passwords_are_unique() {
        let a = ephemeral_password();
        let b = ephemeral_password();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
