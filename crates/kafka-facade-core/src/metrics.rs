//! Prometheus metrics for the topology-concealing proxy.

use prometheus::{Counter, CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};

/// Proxy metrics collection.
///
/// Contains all metrics exposed by the proxy for monitoring.
#[derive(Debug)]
pub struct FacadeMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Current active client sessions.
    pub active_sessions: IntGauge,

    /// Total client sessions accepted.
    pub sessions_total: Counter,

    /// Frames forwarded, by direction.
    pub frames_forwarded: CounterVec,

    /// Responses patched by a rewriter, by api key.
    pub responses_rewritten: CounterVec,

    /// Topology lookup misses during response rewriting.
    pub rewrite_misses: Counter,

    /// Responses that matched no pending request (fatal to their session).
    pub unmatched_responses: Counter,

    /// Impostor certificates minted by the impersonation authority.
    pub impostor_certificates: Counter,
}

impl FacadeMetrics {
    /// Create a new metrics collection.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique
    /// names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_sessions = IntGauge::new(
            "kafka_facade_active_sessions",
            "Current number of active client sessions",
        )
        .expect("metric creation should succeed");

        let sessions_total = Counter::new(
            "kafka_facade_sessions_total",
            "Total number of client sessions accepted",
        )
        .expect("metric creation should succeed");

        let frames_forwarded = CounterVec::new(
            Opts::new(
                "kafka_facade_frames_forwarded_total",
                "Total frames forwarded by direction",
            ),
            &["direction"],
        )
        .expect("metric creation should succeed");

        let responses_rewritten = CounterVec::new(
            Opts::new(
                "kafka_facade_responses_rewritten_total",
                "Total responses patched by a rewriter, by api key",
            ),
            &["api_key"],
        )
        .expect("metric creation should succeed");

        let rewrite_misses = Counter::new(
            "kafka_facade_rewrite_misses_total",
            "Topology lookup misses during response rewriting",
        )
        .expect("metric creation should succeed");

        let unmatched_responses = Counter::new(
            "kafka_facade_unmatched_responses_total",
            "Responses that matched no pending request",
        )
        .expect("metric creation should succeed");

        let impostor_certificates = Counter::new(
            "kafka_facade_impostor_certificates_total",
            "Impostor certificates minted by the impersonation authority",
        )
        .expect("metric creation should succeed");

        registry
            .register(Box::new(active_sessions.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(sessions_total.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(frames_forwarded.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(responses_rewritten.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(rewrite_misses.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(unmatched_responses.clone()))
            .expect("metric registration should succeed");
        registry
            .register(Box::new(impostor_certificates.clone()))
            .expect("metric registration should succeed");

        Self {
            registry,
            active_sessions,
            sessions_total,
            frames_forwarded,
            responses_rewritten,
            rewrite_misses,
            unmatched_responses,
            impostor_certificates,
        }
    }

    /// Encode all metrics in Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for FacadeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
