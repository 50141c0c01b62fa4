//! Kafka Facade Core Library
//!
//! This library provides the core functionality for a topology-concealing
//! Kafka proxy. It terminates client connections on per-node virtual
//! endpoints, opens matching connections to the real backend nodes, and
//! rewrites the responses that embed backend addresses so clients only
//! ever learn proxy-side addresses.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`topology`] - Real-to-advertised endpoint registry
//! - [`protocol`] - Frame codec, request/response correlation, response rewriting
//! - [`ca`] - Downstream identity strategies and certificate impersonation
//! - [`tls`] - TLS acceptor and connector plumbing
//! - [`net`] - Node channels and per-client sessions
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_facade_core::config::FacadeConfig;
//!
//! // Load configuration
//! let config = FacadeConfig::from_file("facade.yaml")?;
//!
//! // Start the proxy channels
//! // ...
//! ```

#![forbid(unsafe_code)]

pub mod ca;
pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod protocol;
pub mod tls;
pub mod topology;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the
/// `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use ca::{CertificateStrategy, DownstreamIdentity, ImpersonationAuthority};
pub use config::{CertificateStrategyConfig, FacadeConfig, SignatureAlgorithm};
pub use error::{CaError, ConfigError, ProxyError, Result, StartupError, TlsError};
pub use metrics::FacadeMetrics;
pub use net::{ChannelManager, NodeChannel};
pub use protocol::{CompositeRewriter, Frame, FrameCodec, RequestLedger};
pub use topology::{Endpoint, NodeMapping, TopologyRegistry};
