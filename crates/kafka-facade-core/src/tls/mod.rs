//! TLS support for both sides of the proxy.
//!
//! The proxy is a TLS server toward clients ([`server`]) and a TLS client
//! toward backend nodes ([`client`]). PEM loading helpers are shared here.

pub mod client;
pub mod server;

use std::io::BufReader;
use std::path::Path;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, warn};

use crate::error::{TlsError, TlsResult};

pub use client::TlsClientConnector;
pub use server::TlsServerAcceptor;

/// Install the ring crypto provider if not already installed.
pub(crate) fn ensure_crypto_provider() {
    // Try to install the ring provider, ignore errors if already installed
    let _ = CryptoProvider::install_default(default_provider());
}

/// Load certificates from a PEM file.
pub(crate) fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load a private key from a PEM file.
pub(crate) fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);

    // Try to read any type of private key (RSA, PKCS8, EC)
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                debug!(path = %path.display(), "loaded PKCS#1 RSA private key");
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                debug!(path = %path.display(), "loaded PKCS#8 private key");
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                debug!(path = %path.display(), "loaded SEC1 EC private key");
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => {
                // Skip non-key items (certificates, etc.)
                continue;
            }
            Ok(None) => {
                // End of file
                break;
            }
            Err(e) => {
                return Err(TlsError::PrivateKeyLoad {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(TlsError::NoPrivateKeys(path.display().to_string()))
}

#[cfg(test)]
pub(crate) mod test_material {
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Generate a self-signed certificate + key PEM pair for tests.
    pub fn self_signed(common_name: &str) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name.to_string());
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    pub fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }
}

#[cfg(test)]
mod tests {
    use super::test_material::{self_signed, write_temp};
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_load_certificates() {
        let (cert_pem, _) = self_signed("test");
        let cert_file = write_temp(&cert_pem);
        let certs = load_certificates(cert_file.path()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_load_private_key() {
        let (_, key_pem) = self_signed("test");
        let key_file = write_temp(&key_pem);
        assert!(load_private_key(key_file.path()).is_ok());
    }

    #[test]
    fn test_load_certificates_file_not_found() {
        let result = load_certificates(&PathBuf::from("/nonexistent/path/cert.pem"));
        assert!(matches!(result, Err(TlsError::CertificateLoad { .. })));
    }

    #[test]
    fn test_load_private_key_file_not_found() {
        let result = load_private_key(&PathBuf::from("/nonexistent/path/key.pem"));
        assert!(matches!(result, Err(TlsError::PrivateKeyLoad { .. })));
    }

    #[test]
    fn test_empty_cert_file() {
        let file = write_temp("not a certificate");
        let result = load_certificates(file.path());
        assert!(matches!(result, Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn test_empty_key_file() {
        let file = write_temp("not a key");
        let result = load_private_key(file.path());
        assert!(matches!(result, Err(TlsError::NoPrivateKeys(_))));
    }
}
