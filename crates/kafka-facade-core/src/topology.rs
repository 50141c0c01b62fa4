//! Backend topology registry.
//!
//! Maps each real backend node endpoint to the advertised (virtual) endpoint
//! clients are allowed to see. The registry is built once from configuration
//! and is read-only afterwards, so lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// A network endpoint, compared by (host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        // rsplit so IPv6-ish hosts with embedded colons keep everything
        // before the last colon as the host part.
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ConfigError;

    fn try_from(s: String) -> ConfigResult<Self> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(e: Endpoint) -> Self {
        e.to_string()
    }
}

/// One backend node known to the proxy: its real address and the advertised
/// address clients are told to use instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMapping {
    /// Node name (unique within the topology).
    pub name: String,
    /// The actual network address of the backend node.
    pub real: Endpoint,
    /// The proxy-side address substituted into responses.
    pub advertised: Endpoint,
}

/// Immutable lookup from real endpoints and node names to mappings.
///
/// Construction fails fast on duplicate names or endpoints; a registry that
/// admits two nodes behind one address could not attribute rewrites.
#[derive(Debug)]
pub struct TopologyRegistry {
    by_real: HashMap<Endpoint, NodeMapping>,
    by_name: HashMap<String, NodeMapping>,
    ordered: Vec<NodeMapping>,
}

impl TopologyRegistry {
    /// Build a registry from declared mappings.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the list is empty or two entries share
    /// a name, a real endpoint, or an advertised endpoint.
    pub fn new(mappings: Vec<NodeMapping>) -> ConfigResult<Self> {
        if mappings.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }

        let mut by_real = HashMap::with_capacity(mappings.len());
        let mut by_name = HashMap::with_capacity(mappings.len());
        let mut advertised_seen = HashMap::with_capacity(mappings.len());

        for mapping in &mappings {
            if by_name
                .insert(mapping.name.clone(), mapping.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateNodeName(mapping.name.clone()));
            }
            if by_real
                .insert(mapping.real.clone(), mapping.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateRealEndpoint(mapping.real.to_string()));
            }
            if advertised_seen
                .insert(mapping.advertised.clone(), ())
                .is_some()
            {
                return Err(ConfigError::DuplicateAdvertisedEndpoint(
                    mapping.advertised.to_string(),
                ));
            }
        }

        Ok(Self {
            by_real,
            by_name,
            ordered: mappings,
        })
    }

    /// Look up a mapping by the backend node's real endpoint.
    #[must_use]
    pub fn resolve_by_real(&self, endpoint: &Endpoint) -> Option<&NodeMapping> {
        self.by_real.get(endpoint)
    }

    /// Look up a mapping by (host, port) as seen in a response payload.
    #[must_use]
    pub fn resolve_by_address(&self, host: &str, port: u16) -> Option<&NodeMapping> {
        self.by_real.get(&Endpoint::new(host, port))
    }

    /// Look up a mapping by node name.
    #[must_use]
    pub fn resolve_by_name(&self, name: &str) -> Option<&NodeMapping> {
        self.by_name.get(name)
    }

    /// All declared mappings, in declaration order.
    #[must_use]
    pub fn all(&self) -> &[NodeMapping] {
        &self.ordered
    }
}
