//! Certificate impersonation authority.
//!
//! Given the certificate a client presented upstream, mints a short-lived
//! "impostor" certificate the proxy can present downstream: same subject,
//! same validity window, but a fresh key pair and serial, signed by the
//! operator's CA. The backend trusts the CA, so the client's identity
//! carries through without the proxy ever holding the client's private key.
//!
//! The validity window is copied from the peer certificate rather than
//! issued fresh; the impostor must not outlive the credential it stands in
//! for.

use std::path::Path;
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::config::SignatureAlgorithm;
use crate::error::{CaError, CaResult};
use crate::metrics::FacadeMetrics;

use super::{ephemeral_password, DownstreamIdentity};

/// Signs impostor certificates with the operator-provided CA key.
///
/// The CA material is loaded once at startup and injected wherever a
/// downstream identity is needed; there is no process-global state.
pub struct ImpersonationAuthority {
    issuer: Issuer<'static, KeyPair>,
    metrics: Arc<FacadeMetrics>,
}

impl ImpersonationAuthority {
    /// Load the CA certificate and private key from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if the material cannot be loaded or does not match
    /// the configured signature algorithm. Fatal at startup.
    pub fn from_files(
        ca_cert_path: &Path,
        ca_key_path: &Path,
        algorithm: SignatureAlgorithm,
        metrics: Arc<FacadeMetrics>,
    ) -> CaResult<Self> {
        let ca_certs =
            crate::tls::load_certificates(ca_cert_path).map_err(|e| CaError::MaterialLoad {
                path: ca_cert_path.display().to_string(),
                message: e.to_string(),
            })?;
        let ca_cert = ca_certs.first().ok_or_else(|| CaError::MaterialLoad {
            path: ca_cert_path.display().to_string(),
            message: "file contains no certificates".to_string(),
        })?;

        let key_pem =
            std::fs::read_to_string(ca_key_path).map_err(|e| CaError::MaterialLoad {
                path: ca_key_path.display().to_string(),
                message: e.to_string(),
            })?;
        let ca_key = KeyPair::from_pem_and_sign_algo(&key_pem, algorithm.rcgen_algorithm())
            .map_err(|e| CaError::MaterialLoad {
                path: ca_key_path.display().to_string(),
                message: e.to_string(),
            })?;

        let issuer =
            Issuer::from_ca_cert_der(ca_cert, ca_key).map_err(|e| CaError::MaterialLoad {
                path: ca_cert_path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(Self { issuer, metrics })
    }

    /// Mint an impostor identity for the given peer certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer certificate cannot be parsed or the
    /// impostor cannot be generated. Fatal to the session, not the process.
    pub fn impersonate(&self, peer: &CertificateDer<'static>) -> CaResult<DownstreamIdentity> {
        let (_, peer_cert) = X509Certificate::from_der(peer.as_ref())
            .map_err(|e| CaError::PeerCertificateParse(e.to_string()))?;

        let subject = peer_cert.subject();
        info!(subject = %subject, "minting impostor certificate");

        let mut params = CertificateParams::default();
        params.distinguished_name = copy_subject(subject);
        params.not_before = peer_cert.validity().not_before.to_datetime();
        params.not_after = peer_cert.validity().not_after.to_datetime();
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        // Fresh RSA-2048 key pair; the peer's public key is never reused.
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)?;
        let cert = params.signed_by(&leaf_key, &self.issuer)?;

        self.metrics.impostor_certificates.inc();

        Ok(DownstreamIdentity {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            password: ephemeral_password(),
        })
    }
}

/// Copy the peer's subject into an rcgen distinguished name, RDN by RDN.
fn copy_subject(subject: &X509Name<'_>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for rdn in subject.iter_rdn() {
        for attr in rdn.iter() {
            let Ok(value) = attr.as_str() else {
                warn!(
                    oid = %attr.attr_type(),
                    "skipping non-string subject attribute"
                );
                continue;
            };
            match dn_type_for(attr) {
                Some(dn_type) => dn.push(dn_type, value),
                None => {
                    warn!(
                        oid = %attr.attr_type(),
                        "skipping subject attribute with unrepresentable oid"
                    );
                }
            }
        }
    }
    dn
}

/// Map an X.500 attribute oid onto rcgen's DnType.
fn dn_type_for(attr: &AttributeTypeAndValue<'_>) -> Option<DnType> {
    let oid = attr.attr_type();
    match oid.to_id_string().as_str() {
        "2.5.4.3" => Some(DnType::CommonName),
        "2.5.4.6" => Some(DnType::CountryName),
        "2.5.4.7" => Some(DnType::LocalityName),
        "2.5.4.8" => Some(DnType::StateOrProvinceName),
        "2.5.4.10" => Some(DnType::OrganizationName),
        "2.5.4.11" => Some(DnType::OrganizationalUnitName),
        _ => oid.iter().map(|arcs| DnType::CustomDnType(arcs.collect())),
    }
}

/// A fresh random certificate serial.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
    // Clear the top bit so the serial stays a positive DER integer.
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

/// A freshly self-signed CA root.
pub struct BootstrappedRoot {
    /// The root certificate (PEM).
    pub cert_pem: String,
    /// The root private key (PEM).
    pub key_pem: String,
}

/// Self-sign a CA root certificate: subject = issuer = the given DN, with
/// the CA basic constraint set. One-time bootstrap for installations
/// without an external CA; the result is the trust anchor backend nodes
/// must be configured to trust.
///
/// # Errors
///
/// Returns an error if key generation or signing fails.
pub fn bootstrap_root(
    common_name: &str,
    organization: Option<&str>,
    validity_days: i64,
    algorithm: SignatureAlgorithm,
) -> CaResult<BootstrappedRoot> {
    let key = KeyPair::generate_for(algorithm.rcgen_algorithm())?;

    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(organization) = organization {
        dn.push(DnType::OrganizationName, organization);
    }
    params.distinguished_name = dn;

    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(validity_days);

    let cert = params.self_signed(&key)?;

    Ok(BootstrappedRoot {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::test_material::write_temp;

    /// Build a peer certificate with a known subject and validity window.
    fn peer_certificate() -> (CertificateDer<'static>, i64, i64) {
        let not_before = ::time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let not_after = ::time::OffsetDateTime::from_unix_timestamp(1_763_072_000).unwrap();

        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "alice");
        dn.push(DnType::OrganizationName, "Wonderland");
        params.distinguished_name = dn;
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from(vec![0x01, 0x02, 0x03]));

        let cert = params.self_signed(&key).unwrap();
        (
            cert.der().clone(),
            not_before.unix_timestamp(),
            not_after.unix_timestamp(),
        )
    }

    fn authority() -> ImpersonationAuthority {
        let root = bootstrap_root(
            "facade-ca",
            Some("Example Corp"),
            3650,
            SignatureAlgorithm::RsaSha256,
        )
        .unwrap();
        let cert_file = write_temp(&root.cert_pem);
        let key_file = write_temp(&root.key_pem);
        ImpersonationAuthority::from_files(
            cert_file.path(),
            key_file.path(),
            SignatureAlgorithm::RsaSha256,
            Arc::new(FacadeMetrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_bootstrap_root_is_ca_and_self_signed() {
        let root = bootstrap_root(
            "facade-ca",
            None,
            365,
            SignatureAlgorithm::RsaSha256,
        )
        .unwrap();

        let der = pem_to_der(&root.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
        assert!(cert.subject().to_string().contains("CN=facade-ca"));
        let bc = cert.basic_constraints().unwrap().unwrap();
        assert!(bc.value.ca);
    }

    #[test]
    fn test_impostor_preserves_subject_and_validity() {
        let authority = authority();
        let (peer, not_before, not_after) = peer_certificate();

        let identity = authority.impersonate(&peer).unwrap();
        let (_, impostor) = X509Certificate::from_der(identity.cert_chain[0].as_ref()).unwrap();

        let subject = impostor.subject().to_string();
        assert!(subject.contains("CN=alice"), "subject was {subject}");
        assert!(subject.contains("O=Wonderland"), "subject was {subject}");

        // Validity window copied exactly, not reissued.
        assert_eq!(
            impostor.validity().not_before.to_datetime().unix_timestamp(),
            not_before
        );
        assert_eq!(
            impostor.validity().not_after.to_datetime().unix_timestamp(),
            not_after
        );
    }

    #[test]
    fn test_impostor_issuer_is_ca_dn() {
        let authority = authority();
        let (peer, _, _) = peer_certificate();

        let identity = authority.impersonate(&peer).unwrap();
        let (_, impostor) = X509Certificate::from_der(identity.cert_chain[0].as_ref()).unwrap();

        let issuer = impostor.issuer().to_string();
        assert!(issuer.contains("CN=facade-ca"), "issuer was {issuer}");
        assert!(issuer.contains("O=Example Corp"), "issuer was {issuer}");
    }

    #[test]
    fn test_impostor_has_fresh_serial_and_key() {
        let authority = authority();
        let (peer, _, _) = peer_certificate();
        let (_, peer_cert) = X509Certificate::from_der(peer.as_ref()).unwrap();

        let identity = authority.impersonate(&peer).unwrap();
        let (_, impostor) = X509Certificate::from_der(identity.cert_chain[0].as_ref()).unwrap();

        assert_ne!(impostor.raw_serial(), peer_cert.raw_serial());
        assert_ne!(
            impostor.public_key().raw,
            peer_cert.public_key().raw,
            "impostor must not reuse the peer's key pair"
        );
    }

    #[test]
    fn test_two_impostors_differ() {
        let authority = authority();
        let (peer, _, _) = peer_certificate();

        let a = authority.impersonate(&peer).unwrap();
        let b = authority.impersonate(&peer).unwrap();

        assert_ne!(a.cert_chain[0], b.cert_chain[0]);
        assert_ne!(a.password, b.password);
    }

    fn pem_to_der(pem: &str) -> Vec<u8> {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        parsed.contents
    }
}
