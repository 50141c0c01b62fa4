//! Configuration types for the topology-concealing proxy.
//!
//! Configuration is loaded from YAML files and validated before use.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::topology::{Endpoint, NodeMapping, TopologyRegistry};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FacadeConfig {
    /// TCP listener configuration shared by all node channels.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Declared backend nodes and their advertised endpoints.
    pub nodes: Vec<NodeConfig>,

    /// Which declared nodes to actively proxy.
    #[serde(default)]
    pub active: NodeSelector,

    /// Client-facing TLS. Absent means plain TCP upstream.
    #[serde(default)]
    pub upstream_tls: Option<UpstreamTlsConfig>,

    /// Backend-facing TLS. Absent means plain TCP downstream.
    #[serde(default)]
    pub downstream_tls: Option<DownstreamTlsConfig>,

    /// How the proxy identifies itself toward the backend.
    #[serde(default)]
    pub certificate: CertificateStrategyConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One declared backend node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Node name, unique within the topology.
    pub name: String,

    /// The backend node's actual address, e.g. "10.0.0.5:9092".
    pub real: Endpoint,

    /// The proxy-side address clients are told to use, e.g.
    /// "proxy.example.com:30001". The proxy listens on this port.
    pub advertised: Endpoint,
}

/// Selector choosing which declared nodes get a listener at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NodeSelector {
    /// The literal string `all`.
    Keyword(String),
    /// An explicit list of node names.
    Names(Vec<String>),
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::Keyword("all".to_string())
    }
}

impl NodeSelector {
    /// Whether the named node is selected.
    #[must_use]
    pub fn selects(&self, name: &str) -> bool {
        match self {
            Self::Keyword(_) => true,
            Self::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Listener limits shared by all node channels.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Local address to bind listeners on. The port always comes from the
    /// node's advertised endpoint; only the host part is taken from here,
    /// since the advertised hostname is usually not locally bindable.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Maximum number of concurrent client sessions per node channel.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum accepted frame size in bytes.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Downstream dial timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bounded wait for in-flight sessions to drain at shutdown, in
    /// milliseconds.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

/// TLS configuration for client-facing listeners.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamTlsConfig {
    /// Path to the server certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Path to the server private key (PEM).
    pub key_path: PathBuf,

    /// Path to the CA bundle used to verify client certificates (PEM).
    pub ca_cert_path: Option<PathBuf>,

    /// Whether clients must present a certificate.
    #[serde(default)]
    pub require_client_cert: bool,
}

/// TLS configuration for backend-facing connections.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DownstreamTlsConfig {
    /// Path to CA certificate file (PEM) for verifying backend
    /// certificates. If not set, uses the bundled webpki roots.
    pub ca_cert_path: Option<PathBuf>,

    /// Whether to verify that the backend's certificate matches the
    /// hostname being dialed. Disabling this skips server certificate
    /// verification entirely (INSECURE - for lab setups only).
    #[serde(default = "default_true")]
    pub verify_hostname: bool,
}

/// How the proxy identifies itself toward the backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum CertificateStrategyConfig {
    /// No downstream client certificate.
    #[default]
    None,

    /// One pre-provisioned identity used for every downstream connection.
    Static {
        /// Path to the client certificate chain (PEM).
        cert_path: PathBuf,
        /// Path to the client private key (PEM).
        key_path: PathBuf,
    },

    /// Mint a short-lived impostor certificate per downstream connection,
    /// preserving the upstream peer's subject identity.
    Impersonate {
        /// Path to the CA certificate (PEM).
        ca_cert_path: PathBuf,
        /// Path to the CA private key (PEM).
        ca_key_path: PathBuf,
        /// Signature algorithm used when signing impostor certificates.
        #[serde(default)]
        signature_algorithm: SignatureAlgorithm,
    },
}

/// Signature algorithm for impostor certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum SignatureAlgorithm {
    /// PKCS#1 RSA with SHA-256 (the default).
    #[default]
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
    /// PKCS#1 RSA with SHA-384.
    #[serde(rename = "rsa-sha384")]
    RsaSha384,
    /// PKCS#1 RSA with SHA-512.
    #[serde(rename = "rsa-sha512")]
    RsaSha512,
}

impl SignatureAlgorithm {
    /// The corresponding rcgen algorithm.
    #[must_use]
    pub fn rcgen_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::RsaSha256 => &rcgen::PKCS_RSA_SHA256,
            Self::RsaSha384 => &rcgen::PKCS_RSA_SHA384,
            Self::RsaSha512 => &rcgen::PKCS_RSA_SHA512,
        }
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

// Default value functions

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_frame_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            max_connections: default_max_connections(),
            max_frame_bytes: default_max_frame_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl FacadeConfig {
    /// Load and validate configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_yaml(contents: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate topology entries, an unknown selector
    /// name, or an invalid selector keyword.
    pub fn validate(&self) -> ConfigResult<()> {
        // Registry construction performs the duplicate checks.
        let _ = self.build_registry()?;

        match &self.active {
            NodeSelector::Keyword(kw) if kw != "all" => {
                return Err(ConfigError::UnknownNode(kw.clone()));
            }
            NodeSelector::Names(names) => {
                for name in names {
                    if !self.nodes.iter().any(|n| &n.name == name) {
                        return Err(ConfigError::UnknownNode(name.clone()));
                    }
                }
            }
            NodeSelector::Keyword(_) => {}
        }

        // Impersonation copies the subject of the certificate the client
        // presents upstream; without upstream TLS there is never one.
        if matches!(
            self.certificate,
            CertificateStrategyConfig::Impersonate { .. }
        ) && self.upstream_tls.is_none()
        {
            return Err(ConfigError::IncompleteStrategy {
                strategy: "impersonate",
                missing: "upstream_tls with client certificate verification",
            });
        }

        Ok(())
    }

    /// Build the topology registry from the declared nodes.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate names or endpoints.
    pub fn build_registry(&self) -> ConfigResult<TopologyRegistry> {
        TopologyRegistry::new(
            self.nodes
                .iter()
                .map(|n| NodeMapping {
                    name: n.name.clone(),
                    real: n.real.clone(),
                    advertised: n.advertised.clone(),
                })
                .collect(),
        )
    }

    /// The declared nodes selected for proxying at startup.
    #[must_use]
    pub fn selected_nodes(&self) -> Vec<&NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| self.active.selects(&n.name))
            .collect()
    }

    /// The local socket address a node channel binds for a mapping.
    #[must_use]
    pub fn bind_address_for(&self, advertised: &Endpoint) -> String {
        format!("{}:{}", self.listener.bind_host, advertised.port)
    }
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable
/// `VAR_NAME`. If the variable is not set, replaces with an empty string.
pub fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}
