//! Per-client proxy session.
//!
//! One session owns one upstream (client-facing) connection and one
//! downstream (backend-facing) connection, and moves through the states:
//! accepted, optional upstream TLS handshake, downstream dial (with the
//! identity obtained from the certificate strategy), bidirectional
//! forwarding, closing.
//!
//! Forwarding runs as two concurrent pump tasks, one per read direction,
//! which share only the per-session request ledger and the opposite socket.
//! Whichever pump finishes first, for whatever reason, aborts the other;
//! dropping a pump closes its streams, so closing either side propagates to
//! the other. Frames move by ownership through the pumps, which makes
//! double-release unrepresentable and leaks a matter of dropping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

use crate::ca::CertificateStrategy;
use crate::config::{DownstreamTlsConfig, ListenerConfig};
use crate::error::{ProxyError, Result};
use crate::metrics::FacadeMetrics;
use crate::protocol::codec::{response_correlation_id, Frame, FrameCodec, RequestHeaderInfo};
use crate::protocol::correlator::RequestLedger;
use crate::protocol::rewrite::CompositeRewriter;
use crate::tls::{TlsClientConnector, TlsServerAcceptor};
use crate::topology::NodeMapping;

use super::downstream::DownstreamStream;
use super::upstream::UpstreamStream;

/// Shared wiring for every session of one node channel.
pub struct SessionContext {
    /// The node this channel fronts.
    pub mapping: NodeMapping,
    /// Response rewriting engine.
    pub rewriter: Arc<CompositeRewriter>,
    /// Downstream identity strategy.
    pub strategy: Arc<CertificateStrategy>,
    /// Upstream TLS acceptor, when client-facing TLS is enabled.
    pub acceptor: Option<TlsServerAcceptor>,
    /// Downstream TLS configuration, when backend-facing TLS is enabled.
    pub downstream_tls: Option<DownstreamTlsConfig>,
    /// Metrics collection.
    pub metrics: Arc<FacadeMetrics>,
    /// Listener limits (frame size, connect timeout).
    pub listener: ListenerConfig,
    session_seq: AtomicU64,
}

impl SessionContext {
    /// Create the shared context for one node channel.
    #[must_use]
    pub fn new(
        mapping: NodeMapping,
        rewriter: Arc<CompositeRewriter>,
        strategy: Arc<CertificateStrategy>,
        acceptor: Option<TlsServerAcceptor>,
        downstream_tls: Option<DownstreamTlsConfig>,
        metrics: Arc<FacadeMetrics>,
        listener: ListenerConfig,
    ) -> Self {
        Self {
            mapping,
            rewriter,
            strategy,
            acceptor,
            downstream_tls,
            metrics,
            listener,
            session_seq: AtomicU64::new(0),
        }
    }

    fn next_session_id(&self) -> String {
        let seq = self.session_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.mapping.name, seq)
    }

    fn frame_codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_size(self.listener.max_frame_bytes)
    }
}

/// Run one client session to completion.
///
/// # Errors
///
/// Returns the error that ended the session. Clean client EOF is not an
/// error; everything else is logged by the caller with session context.
pub async fn run_session(
    context: Arc<SessionContext>,
    socket: TcpStream,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let session_id = context.next_session_id();
    let peer = socket
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    // Optional upstream TLS handshake. Failure closes the connection and is
    // reported, not retried.
    let upstream = match &context.acceptor {
        Some(acceptor) => UpstreamStream::tls(acceptor.accept(socket).await?),
        None => UpstreamStream::plain(socket),
    };

    // The downstream identity may depend on the peer certificate that only
    // exists now, after the handshake.
    let peer_certificate = upstream
        .peer_certificates()
        .and_then(|chain| chain.first())
        .cloned();

    info!(
        session_id = %session_id,
        peer = %peer,
        node = %context.mapping.name,
        tls = upstream.is_tls(),
        client_cert = peer_certificate.is_some(),
        "client connected"
    );

    let downstream = dial_downstream(&context, peer_certificate.as_ref()).await?;

    context.metrics.sessions_total.inc();
    context.metrics.active_sessions.inc();
    let result = forward(&context, upstream, downstream, &mut shutdown_rx).await;
    context.metrics.active_sessions.dec();

    match &result {
        Ok(()) => debug!(session_id = %session_id, peer = %peer, "session closed"),
        Err(ProxyError::Shutdown) => {
            debug!(session_id = %session_id, peer = %peer, "session closed: shutdown");
        }
        Err(e) => {
            warn!(session_id = %session_id, peer = %peer, error = %e, "session failed");
        }
    }
    result
}

/// Dial the real node, optionally wrapping the connection in TLS with the
/// identity obtained from the certificate strategy.
async fn dial_downstream(
    context: &SessionContext,
    peer_certificate: Option<&rustls::pki_types::CertificateDer<'static>>,
) -> Result<DownstreamStream> {
    let identity = context
        .strategy
        .obtain_downstream_identity(peer_certificate)?;

    let real = &context.mapping.real;
    let connect_timeout = Duration::from_millis(context.listener.connect_timeout_ms);
    let tcp = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((real.host.as_str(), real.port)),
    )
    .await
    .map_err(|_| ProxyError::DialFailed {
        endpoint: real.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
    })?
    .map_err(|e| ProxyError::DialFailed {
        endpoint: real.to_string(),
        source: e,
    })?;

    // The identity, impostor key material included, lives exactly as long
    // as this dial.
    match &context.downstream_tls {
        Some(tls_config) => {
            let connector = TlsClientConnector::new(tls_config, identity.as_ref())?;
            let stream = connector.connect(&real.host, tcp).await?;
            debug!(endpoint = %real, "downstream TLS established");
            Ok(DownstreamStream::tls(stream))
        }
        None => Ok(DownstreamStream::plain(tcp)),
    }
}

/// Bidirectional forwarding until either side closes or fails.
async fn forward(
    context: &SessionContext,
    upstream: UpstreamStream,
    downstream: DownstreamStream,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<()> {
    let ledger = Arc::new(RequestLedger::new());

    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let (downstream_read, downstream_write) = tokio::io::split(downstream);

    let mut requests = tokio::spawn(pump_requests(
        FramedRead::new(upstream_read, context.frame_codec()),
        FramedWrite::new(downstream_write, context.frame_codec()),
        Arc::clone(&ledger),
        Arc::clone(&context.metrics),
    ));
    let mut responses = tokio::spawn(pump_responses(
        FramedRead::new(downstream_read, context.frame_codec()),
        FramedWrite::new(upstream_write, context.frame_codec()),
        ledger,
        Arc::clone(&context.rewriter),
        Arc::clone(&context.metrics),
    ));

    // Whichever pump finishes first takes the other down with it; aborting
    // drops the abandoned halves, which closes the underlying sockets.
    let result = tokio::select! {
        r = &mut requests => {
            responses.abort();
            join_result(r)
        }
        r = &mut responses => {
            requests.abort();
            join_result(r)
        }
        _ = shutdown_rx.recv() => {
            requests.abort();
            responses.abort();
            Err(ProxyError::Shutdown)
        }
    };
    result
}

fn join_result(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        // Cancellation is close propagation at work; a panic is not.
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ProxyError::Connection(std::io::Error::other(e))),
    }
}

/// Upstream-read loop: record every request in the ledger, then forward it
/// downstream unchanged.
async fn pump_requests<R, W>(
    mut source: FramedRead<R, FrameCodec>,
    mut sink: FramedWrite<W, FrameCodec>,
    ledger: Arc<RequestLedger>,
    metrics: Arc<FacadeMetrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = source.next().await.transpose()? {
        let header = RequestHeaderInfo::parse(&frame.payload)?;
        trace!(
            api_key = header.api_key,
            api_version = header.api_version,
            correlation_id = header.correlation_id,
            "forwarding request"
        );
        ledger.record(header.into());
        metrics.frames_forwarded.with_label_values(&["request"]).inc();
        sink.send(frame).await?;
    }
    // Clean client EOF.
    Ok(())
}

/// Downstream-read loop: match every response against the ledger, offer it
/// to the rewriting engine, then forward the result upstream.
async fn pump_responses<R, W>(
    mut source: FramedRead<R, FrameCodec>,
    mut sink: FramedWrite<W, FrameCodec>,
    ledger: Arc<RequestLedger>,
    rewriter: Arc<CompositeRewriter>,
    metrics: Arc<FacadeMetrics>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = source.next().await.transpose()? {
        let correlation_id = response_correlation_id(&frame.payload)?;
        let Some(pending) = ledger.claim(correlation_id) else {
            metrics.unmatched_responses.inc();
            return Err(ProxyError::UnmatchedResponse { correlation_id });
        };

        let outcome = rewriter.rewrite(&pending, frame.payload)?;
        if outcome.is_rewritten() {
            let api_key_label = pending.api_key.to_string();
            metrics
                .responses_rewritten
                .with_label_values(&[api_key_label.as_str()])
                .inc();
        }
        trace!(
            correlation_id,
            api_key = pending.api_key,
            rewritten = outcome.is_rewritten(),
            "forwarding response"
        );
        metrics
            .frames_forwarded
            .with_label_values(&["response"])
            .inc();
        sink.send(Frame::new(outcome.into_payload())).await?;
    }
    // Backend EOF.
    Ok(())
}
