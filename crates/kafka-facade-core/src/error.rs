//! Domain error types for the topology-concealing proxy.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Configuration and CA-key-loading failures are fatal at startup; every
//! other error is scoped to a single proxied session.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Two node mappings share the same name.
    #[error("duplicate node name in topology: {0}")]
    DuplicateNodeName(String),

    /// Two node mappings share the same real endpoint.
    #[error("duplicate real endpoint in topology: {0}")]
    DuplicateRealEndpoint(String),

    /// Two node mappings share the same advertised (virtual) endpoint.
    #[error("duplicate advertised endpoint in topology: {0}")]
    DuplicateAdvertisedEndpoint(String),

    /// The active-node selector references a node that was never declared.
    #[error("selector references unknown node: {0}")]
    UnknownNode(String),

    /// The topology must declare at least one node.
    #[error("topology declares no nodes")]
    EmptyTopology,

    /// A certificate strategy was selected without the material it needs.
    #[error("certificate strategy '{strategy}' requires {missing}")]
    IncompleteStrategy {
        strategy: &'static str,
        missing: &'static str,
    },
}

/// Errors related to TLS material loading and handshakes.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Failed to load a certificate file.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Failed to load a private key file.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// A PEM file contained no usable certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// A PEM file contained no usable private keys.
    #[error("no private keys found in '{0}'")]
    NoPrivateKeys(String),

    /// TLS handshake failure.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Invalid TLS configuration.
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Errors raised by the certificate-impersonation authority.
#[derive(Error, Debug)]
pub enum CaError {
    /// The impersonation strategy needs the upstream peer's certificate.
    #[error("peer certificate required for impersonation but none was presented")]
    PeerCertificateRequired,

    /// The peer's certificate could not be parsed.
    #[error("failed to parse peer certificate: {0}")]
    PeerCertificateParse(String),

    /// Failed to load CA key material.
    #[error("failed to load CA material from '{path}': {message}")]
    MaterialLoad { path: String, message: String },

    /// Certificate generation or signing failed.
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}

/// Errors that occur while proxying a session.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// A frame declared a length beyond the configured maximum.
    #[error("frame size {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// A frame was too short to carry the header it must carry.
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Failed to decode a response payload the proxy must rewrite.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to re-encode a rewritten response payload.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// A response arrived with no pending request bearing its id.
    ///
    /// Fatal to the session: a response the proxy cannot attribute to a
    /// request cannot be safely rewritten or forwarded.
    #[error("unmatched response: no pending request with correlation id {correlation_id}")]
    UnmatchedResponse { correlation_id: i32 },

    /// Dialing the real node failed.
    #[error("downstream dial to {endpoint} failed: {source}")]
    DialFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS failure in either direction.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Certificate authority failure while building the downstream identity.
    #[error("certificate authority error: {0}")]
    Ca(#[from] CaError),

    /// Shutdown signal received.
    #[error("proxy shutting down")]
    Shutdown,
}

/// Errors that prevent the proxy from starting at all.
///
/// Everything here is raised before any listener binds; the process exits
/// instead of limping along with partial wiring.
#[derive(Error, Debug)]
pub enum StartupError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unusable TLS material.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Unusable CA key material.
    #[error(transparent)]
    Ca(#[from] CaError),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;

/// Result type alias for certificate authority operations.
pub type CaResult<T> = std::result::Result<T, CaError>;
