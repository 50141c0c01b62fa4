//! Cluster metadata rewriter.
//!
//! Metadata responses list every broker in the cluster as `(node_id, host,
//! port)`. Each listed address is looked up in the topology registry and,
//! when a mapping exists, replaced with the advertised proxy endpoint so
//! clients only ever learn proxy-side addresses. A broker absent from the
//! topology is left unchanged and logged: the client cannot reach it
//! through the proxy, but silently dropping it would hide the
//! misconfiguration.

use std::sync::Arc;

use bytes::Bytes;
use kafka_protocol::messages::MetadataResponse;
use kafka_protocol::protocol::StrBytes;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::FacadeMetrics;
use crate::protocol::correlator::PendingRequest;
use crate::protocol::rewrite::{decode_response, encode_response, RewriteOutcome};
use crate::topology::TopologyRegistry;

/// Rewriter for "describe cluster topology" responses.
#[derive(Debug)]
pub struct TopologyRewriter {
    registry: Arc<TopologyRegistry>,
    metrics: Arc<FacadeMetrics>,
}

impl TopologyRewriter {
    /// Create a rewriter backed by the given registry.
    #[must_use]
    pub fn new(registry: Arc<TopologyRegistry>, metrics: Arc<FacadeMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Patch broker addresses in a metadata response payload.
    ///
    /// # Errors
    ///
    /// Returns a decode/encode error if the payload does not parse as a
    /// metadata response of the request's version.
    pub fn rewrite(&self, request: &PendingRequest, payload: Bytes) -> Result<RewriteOutcome> {
        let (header, mut response) = decode_response::<MetadataResponse>(request, &payload)?;

        let mut changed = false;
        for broker in &mut response.brokers {
            let host = broker.host.to_string();
            let Ok(port) = u16::try_from(broker.port) else {
                warn!(
                    node_id = broker.node_id.0,
                    port = broker.port,
                    "metadata response carries an out-of-range broker port; left unchanged"
                );
                self.metrics.rewrite_misses.inc();
                continue;
            };

            match self.registry.resolve_by_address(&host, port) {
                Some(mapping) => {
                    debug!(
                        node_id = broker.node_id.0,
                        real = %mapping.real,
                        advertised = %mapping.advertised,
                        "rewriting metadata broker address"
                    );
                    broker.host = StrBytes::from_string(mapping.advertised.host.clone());
                    broker.port = i32::from(mapping.advertised.port);
                    changed = true;
                }
                None => {
                    warn!(
                        node_id = broker.node_id.0,
                        address = %format!("{host}:{port}"),
                        "unknown broker address in metadata response; left unchanged"
                    );
                    self.metrics.rewrite_misses.inc();
                }
            }
        }

        if !changed {
            // Nothing substituted; forward the original bytes untouched.
            return Ok(RewriteOutcome::PassThrough(payload));
        }

        let rewritten = encode_response(request, &header, &response)?;
        Ok(RewriteOutcome::Rewritten(rewritten))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use kafka_protocol::messages::metadata_response::MetadataResponseBroker;
    use kafka_protocol::messages::{ApiKey, BrokerId, ResponseHeader};
    use kafka_protocol::protocol::Encodable;
    use crate::topology::NodeMapping;

    const API_VERSION: i16 = 9;

    fn registry() -> Arc<TopologyRegistry> {
        Arc::new(
            TopologyRegistry::new(vec![
                NodeMapping {
                    name: "broker-1".to_string(),
                    real: "10.0.0.5:9092".parse().unwrap(),
                    advertised: "proxy.example.com:30001".parse().unwrap(),
                },
                NodeMapping {
                    name: "broker-2".to_string(),
                    real: "10.0.0.6:9092".parse().unwrap(),
                    advertised: "proxy.example.com:30002".parse().unwrap(),
                },
            ])
            .unwrap(),
        )
    }

    fn rewriter(registry: Arc<TopologyRegistry>) -> (TopologyRewriter, Arc<FacadeMetrics>) {
        let metrics = Arc::new(FacadeMetrics::new());
        (
            TopologyRewriter::new(registry, Arc::clone(&metrics)),
            metrics,
        )
    }

    fn broker(node_id: i32, host: &str, port: i32) -> MetadataResponseBroker {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(node_id);
        broker.host = StrBytes::from_string(host.to_string());
        broker.port = port;
        broker
    }

    fn encode_metadata(response: &MetadataResponse, correlation_id: i32) -> Bytes {
        let header_version =
            ApiKey::MetadataKey.response_header_version(API_VERSION);
        let mut header = ResponseHeader::default();
        header.correlation_id = correlation_id;

        let mut buf = BytesMut::new();
        header.encode(&mut buf, header_version).unwrap();
        response.encode(&mut buf, API_VERSION).unwrap();
        buf.freeze()
    }

    fn request(correlation_id: i32) -> PendingRequest {
        PendingRequest {
            correlation_id,
            api_key: ApiKey::MetadataKey as i16,
            api_version: API_VERSION,
        }
    }

    fn decode_rewritten(request: &PendingRequest, payload: &Bytes) -> MetadataResponse {
        let (_, response) = decode_response::<MetadataResponse>(request, payload).unwrap();
        response
    }

    #[test]
    fn test_mapped_brokers_substituted() {
        let (rewriter, _) = rewriter(registry());

        let mut response = MetadataResponse::default();
        response.brokers.push(broker(1, "10.0.0.5", 9092));
        response.brokers.push(broker(2, "10.0.0.6", 9092));

        let request = request(42);
        let payload = encode_metadata(&response, 42);
        let outcome = rewriter.rewrite(&request, payload).unwrap();
        assert!(outcome.is_rewritten());

        let rewritten = decode_rewritten(&request, &outcome.into_payload());
        assert_eq!(rewritten.brokers[0].host.to_string(), "proxy.example.com");
        assert_eq!(rewritten.brokers[0].port, 30001);
        assert_eq!(rewritten.brokers[1].host.to_string(), "proxy.example.com");
        assert_eq!(rewritten.brokers[1].port, 30002);
        // Node ids are not the proxy's to touch.
        assert_eq!(rewritten.brokers[0].node_id, BrokerId(1));
        assert_eq!(rewritten.brokers[1].node_id, BrokerId(2));
    }

    #[test]
    fn test_unmapped_broker_left_unchanged_and_warned() {
        let (rewriter, metrics) = rewriter(registry());

        let mut response = MetadataResponse::default();
        response.brokers.push(broker(1, "10.0.0.5", 9092));
        response.brokers.push(broker(9, "10.9.9.9", 9092));

        let request = request(7);
        let payload = encode_metadata(&response, 7);
        let outcome = rewriter.rewrite(&request, payload).unwrap();
        assert!(outcome.is_rewritten());

        let rewritten = decode_rewritten(&request, &outcome.into_payload());
        assert_eq!(rewritten.brokers[0].port, 30001);
        assert_eq!(rewritten.brokers[1].host.to_string(), "10.9.9.9");
        assert_eq!(rewritten.brokers[1].port, 9092);
        assert_eq!(metrics.rewrite_misses.get() as u64, 1);
    }

    #[test]
    fn test_fully_unmapped_response_passes_through_byte_identical() {
        let (rewriter, metrics) = rewriter(registry());

        let mut response = MetadataResponse::default();
        response.brokers.push(broker(9, "10.9.9.9", 9092));

        let request = request(3);
        let payload = encode_metadata(&response, 3);
        let outcome = rewriter.rewrite(&request, payload.clone()).unwrap();

        assert!(!outcome.is_rewritten());
        assert_eq!(outcome.into_payload(), payload);
        assert_eq!(metrics.rewrite_misses.get() as u64, 1);
    }

    #[test]
    fn test_correlation_id_preserved() {
        let (rewriter, _) = rewriter(registry());

        let mut response = MetadataResponse::default();
        response.brokers.push(broker(1, "10.0.0.5", 9092));

        let request = request(987_654);
        let payload = encode_metadata(&response, 987_654);
        let rewritten = rewriter.rewrite(&request, payload).unwrap().into_payload();

        assert_eq!(
            crate::protocol::codec::response_correlation_id(&rewritten).unwrap(),
            987_654
        );
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let (rewriter, _) = rewriter(registry());
        let request = request(1);
        let payload = Bytes::from_static(&[0, 0, 0, 1, 0xff]);
        assert!(rewriter.rewrite(&request, payload).is_err());
    }
}
