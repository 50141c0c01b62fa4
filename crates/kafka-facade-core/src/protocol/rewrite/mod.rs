//! Response rewriting engine.
//!
//! The proxy is a transparent pass-through for every frame except the two
//! response types that embed backend addresses: cluster metadata and
//! coordinator lookups. Each rewriter declares which request api key it
//! applies to and patches only the address fields of the matching response,
//! using the versioned protocol schema; everything else is forwarded
//! byte-for-byte, with no decode/re-encode round-trip that could introduce
//! serialization drift.
//!
//! Rewriters form a closed set dispatched by match, not trait objects;
//! extending the proxy means adding a variant.

mod coordinator;
mod metadata;

pub use coordinator::CoordinatorRewriter;
pub use metadata::TopologyRewriter;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{ApiKey, ResponseHeader};
use kafka_protocol::protocol::{Decodable, Encodable};
use tracing::trace;

use crate::error::{ProxyError, Result};
use crate::metrics::FacadeMetrics;
use crate::protocol::correlator::PendingRequest;
use crate::topology::TopologyRegistry;

/// The result of offering a response payload to the rewriting engine.
#[derive(Debug)]
pub enum RewriteOutcome {
    /// The payload was decoded, patched and re-encoded.
    Rewritten(Bytes),
    /// No rewrite applied; the original bytes are forwarded verbatim.
    PassThrough(Bytes),
}

impl RewriteOutcome {
    /// The bytes to forward upstream, whichever way they were produced.
    #[must_use]
    pub fn into_payload(self) -> Bytes {
        match self {
            Self::Rewritten(payload) | Self::PassThrough(payload) => payload,
        }
    }

    /// Whether the payload was actually rewritten.
    #[must_use]
    pub fn is_rewritten(&self) -> bool {
        matches!(self, Self::Rewritten(_))
    }
}

/// One protocol-specific response rewriter.
#[derive(Debug)]
pub enum Rewriter {
    /// Patches broker addresses in cluster metadata responses.
    Topology(TopologyRewriter),
    /// Patches the coordinator address in coordinator lookup responses.
    Coordinator(CoordinatorRewriter),
}

impl Rewriter {
    /// Whether this rewriter handles responses to the given request type.
    #[must_use]
    pub fn applies_to(&self, api_key: i16) -> bool {
        match self {
            Self::Topology(_) => api_key == ApiKey::MetadataKey as i16,
            Self::Coordinator(_) => api_key == ApiKey::FindCoordinatorKey as i16,
        }
    }

    /// Rewrite a response payload (response header included).
    ///
    /// # Errors
    ///
    /// Returns a decode/encode error if the payload does not parse as the
    /// versioned response type; that is fatal to the session, since a
    /// response the proxy failed to inspect could leak real endpoints.
    pub fn rewrite(&self, request: &PendingRequest, payload: Bytes) -> Result<RewriteOutcome> {
        match self {
            Self::Topology(rewriter) => rewriter.rewrite(request, payload),
            Self::Coordinator(rewriter) => rewriter.rewrite(request, payload),
        }
    }
}

/// Ordered list of rewriters; the first applicable one wins.
#[derive(Debug)]
pub struct CompositeRewriter {
    rewriters: Vec<Rewriter>,
}

impl CompositeRewriter {
    /// Create a composite from an explicit rewriter list.
    #[must_use]
    pub fn new(rewriters: Vec<Rewriter>) -> Self {
        Self { rewriters }
    }

    /// The standard rewriter set for a topology registry: cluster metadata
    /// and coordinator lookups.
    #[must_use]
    pub fn standard(registry: Arc<TopologyRegistry>, metrics: Arc<FacadeMetrics>) -> Self {
        Self::new(vec![
            Rewriter::Topology(TopologyRewriter::new(
                Arc::clone(&registry),
                Arc::clone(&metrics),
            )),
            Rewriter::Coordinator(CoordinatorRewriter::new(registry, metrics)),
        ])
    }

    /// Whether any member applies to the given request type.
    #[must_use]
    pub fn applies_to(&self, api_key: i16) -> bool {
        self.rewriters.iter().any(|r| r.applies_to(api_key))
    }

    /// Dispatch to the first applying member, or pass the bytes through.
    ///
    /// # Errors
    ///
    /// Propagates the selected rewriter's decode/encode failures.
    pub fn rewrite(&self, request: &PendingRequest, payload: Bytes) -> Result<RewriteOutcome> {
        for rewriter in &self.rewriters {
            if rewriter.applies_to(request.api_key) {
                return rewriter.rewrite(request, payload);
            }
        }
        trace!(
            api_key = request.api_key,
            correlation_id = request.correlation_id,
            "no rewriter applies; passing response through"
        );
        Ok(RewriteOutcome::PassThrough(payload))
    }
}

/// Decode a response payload into its header and typed body.
pub(crate) fn decode_response<T: Decodable>(
    request: &PendingRequest,
    payload: &Bytes,
) -> Result<(ResponseHeader, T)> {
    let api_key = ApiKey::try_from(request.api_key).map_err(|_| ProxyError::ProtocolDecode {
        message: format!("unknown api key {} offered for rewriting", request.api_key),
    })?;
    let header_version = api_key.response_header_version(request.api_version);

    let mut buf = payload.clone();
    let header = ResponseHeader::decode(&mut buf, header_version).map_err(|e| {
        ProxyError::ProtocolDecode {
            message: format!("response header: {e}"),
        }
    })?;
    let body = T::decode(&mut buf, request.api_version).map_err(|e| ProxyError::ProtocolDecode {
        message: format!("{api_key:?} v{} response body: {e}", request.api_version),
    })?;
    Ok((header, body))
}

/// Re-encode a patched response with its original header.
pub(crate) fn encode_response<T: Encodable>(
    request: &PendingRequest,
    header: &ResponseHeader,
    body: &T,
) -> Result<Bytes> {
    let api_key = ApiKey::try_from(request.api_key).map_err(|_| ProxyError::ProtocolEncode {
        message: format!("unknown api key {}", request.api_key),
    })?;
    let header_version = api_key.response_header_version(request.api_version);

    let mut buf = BytesMut::new();
    header
        .encode(&mut buf, header_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("response header: {e}"),
        })?;
    body.encode(&mut buf, request.api_version)
        .map_err(|e| ProxyError::ProtocolEncode {
            message: format!("{api_key:?} v{} response body: {e}", request.api_version),
        })?;
    Ok(buf.freeze())
}
