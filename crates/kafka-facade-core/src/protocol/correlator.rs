//! Request/response correlator.
//!
//! Every request forwarded downstream is recorded here until its matching
//! response comes back. The table is scoped to one client session; the
//! session's two pump tasks insert and remove concurrently, so the map is
//! a `DashMap` rather than a plain `HashMap` behind the session.

use dashmap::DashMap;
use tracing::warn;

use super::codec::RequestHeaderInfo;

/// Metadata of a request that has been forwarded but not yet answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Client-chosen identifier linking the request to its response.
    pub correlation_id: i32,
    /// The numeric API key of the request.
    pub api_key: i16,
    /// The API version of the request.
    pub api_version: i16,
}

impl From<RequestHeaderInfo> for PendingRequest {
    fn from(header: RequestHeaderInfo) -> Self {
        Self {
            correlation_id: header.correlation_id,
            api_key: header.api_key,
            api_version: header.api_version,
        }
    }
}

/// In-flight request table for one session.
///
/// At most one entry per live correlation id. Correlation ids are the
/// client's responsibility; if a client reuses a live id, the newer entry
/// overwrites the older one and the collision is logged, since a later
/// response can then only be attributed to the most recent request.
#[derive(Debug, Default)]
pub struct RequestLedger {
    pending: DashMap<i32, PendingRequest>,
}

impl RequestLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request that is being forwarded downstream.
    pub fn record(&self, request: PendingRequest) {
        if let Some(previous) = self.pending.insert(request.correlation_id, request) {
            warn!(
                correlation_id = request.correlation_id,
                previous_api_key = previous.api_key,
                api_key = request.api_key,
                "correlation id reused while still in flight; previous entry overwritten"
            );
        }
    }

    /// Claim the pending request matching a response.
    ///
    /// Removes and returns the entry. `None` means the response cannot be
    /// attributed to any forwarded request, which is fatal to the session.
    #[must_use]
    pub fn claim(&self, correlation_id: i32) -> Option<PendingRequest> {
        self.pending.remove(&correlation_id).map(|(_, v)| v)
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pending(correlation_id: i32, api_key: i16) -> PendingRequest {
        PendingRequest {
            correlation_id,
            api_key,
            api_version: 9,
        }
    }

    #[test]
    fn test_record_and_claim() {
        let ledger = RequestLedger::new();
        ledger.record(pending(1, 3));
        assert_eq!(ledger.in_flight(), 1);

        let claimed = ledger.claim(1).unwrap();
        assert_eq!(claimed.api_key, 3);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[test]
    fn test_claim_is_consume_once() {
        let ledger = RequestLedger::new();
        ledger.record(pending(7, 3));
        assert!(ledger.claim(7).is_some());
        assert!(ledger.claim(7).is_none());
    }

    #[test]
    fn test_unmatched_claim() {
        let ledger = RequestLedger::new();
        assert!(ledger.claim(99).is_none());
    }

    #[test]
    fn test_collision_overwrites_with_newest() {
        let ledger = RequestLedger::new();
        ledger.record(pending(5, 3));
        ledger.record(pending(5, 10));
        assert_eq!(ledger.in_flight(), 1);

        // The response is attributed to the most recently forwarded request.
        let claimed = ledger.claim(5).unwrap();
        assert_eq!(claimed.api_key, 10);
    }

    #[test]
    fn test_interleaved_ids_match_independently() {
        let ledger = RequestLedger::new();
        ledger.record(pending(1, 3));
        ledger.record(pending(2, 10));
        ledger.record(pending(3, 0));

        assert_eq!(ledger.claim(2).unwrap().api_key, 10);
        assert_eq!(ledger.claim(1).unwrap().api_key, 3);
        assert_eq!(ledger.claim(3).unwrap().api_key, 0);
    }

    #[tokio::test]
    async fn test_concurrent_record_and_claim() {
        let ledger = Arc::new(RequestLedger::new());

        let writer = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                for id in 0..1000 {
                    ledger.record(pending(id, 3));
                }
            })
        };
        let reader = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let mut claimed = 0;
                while claimed < 1000 {
                    for id in 0..1000 {
                        if ledger.claim(id).is_some() {
                            claimed += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                claimed
            })
        };

        writer.await.unwrap();
        assert_eq!(reader.await.unwrap(), 1000);
        assert_eq!(ledger.in_flight(), 0);
    }
}
