//! Coordinator lookup rewriter.
//!
//! Coordinator lookup responses point a client at the single node that
//! coordinates its group or transaction. Versions 0-3 carry one `(host,
//! port)` pair inline; version 4 moved to a list of coordinators. Both
//! shapes get the same treatment as metadata brokers: substitute the
//! advertised endpoint when the topology knows the address, warn and leave
//! it alone when it does not. An empty host (an error response, or a
//! not-yet-available coordinator) is skipped.

use std::sync::Arc;

use bytes::Bytes;
use kafka_protocol::messages::FindCoordinatorResponse;
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::FacadeMetrics;
use crate::protocol::correlator::PendingRequest;
use crate::protocol::rewrite::{decode_response, encode_response, RewriteOutcome};
use crate::topology::TopologyRegistry;

/// Rewriter for "locate coordinator" responses.
#[derive(Debug)]
pub struct CoordinatorRewriter {
    registry: Arc<TopologyRegistry>,
    metrics: Arc<FacadeMetrics>,
}

impl CoordinatorRewriter {
    /// Create a rewriter backed by the given registry.
    #[must_use]
    pub fn new(registry: Arc<TopologyRegistry>, metrics: Arc<FacadeMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Patch the coordinator address in a response payload.
    ///
    /// # Errors
    ///
    /// Returns a decode/encode error if the payload does not parse as a
    /// coordinator lookup response of the request's version.
    pub fn rewrite(&self, request: &PendingRequest, payload: Bytes) -> Result<RewriteOutcome> {
        let (header, mut response) = decode_response::<FindCoordinatorResponse>(request, &payload)?;

        let mut changed = false;

        // v0-v3 inline coordinator
        if let Some((host, port)) = self.substitute(&response.host, response.port) {
            response.host = host;
            response.port = port;
            changed = true;
        }

        // v4+ coordinator list
        for coordinator in &mut response.coordinators {
            if let Some((host, port)) = self.substitute(&coordinator.host, coordinator.port) {
                coordinator.host = host;
                coordinator.port = port;
                changed = true;
            }
        }

        if !changed {
            return Ok(RewriteOutcome::PassThrough(payload));
        }

        let rewritten = encode_response(request, &header, &response)?;
        Ok(RewriteOutcome::Rewritten(rewritten))
    }

    /// Resolve one coordinator address, returning the substitute fields if
    /// the topology knows it.
    fn substitute(&self, host: &StrBytes, port: i32) -> Option<(StrBytes, i32)> {
        if host.is_empty() {
            return None;
        }
        let Ok(port) = u16::try_from(port) else {
            return None;
        };

        match self.registry.resolve_by_address(host, port) {
            Some(mapping) => {
                debug!(
                    real = %mapping.real,
                    advertised = %mapping.advertised,
                    "rewriting coordinator address"
                );
                Some((
                    StrBytes::from_string(mapping.advertised.host.clone()),
                    i32::from(mapping.advertised.port),
                ))
            }
            None => {
                warn!(
                    address = %format!("{host}:{port}"),
                    "unknown coordinator address in response; left unchanged"
                );
                self.metrics.rewrite_misses.inc();
                None
            }
        }
    }
}
