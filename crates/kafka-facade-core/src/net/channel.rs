//! Node channels and their activation table.
//!
//! A [`NodeChannel`] is one TCP listener on a node's advertised endpoint,
//! accepting client sessions for exactly that node. Channels are created
//! lazily through the [`ChannelManager`], whose activation table guarantees
//! at-most-once creation and start per virtual endpoint, however many tasks
//! race to reference the same node first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ca::CertificateStrategy;
use crate::config::FacadeConfig;
use crate::error::{ConfigError, ProxyError, Result, StartupError};
use crate::metrics::FacadeMetrics;
use crate::protocol::rewrite::CompositeRewriter;
use crate::tls::TlsServerAcceptor;
use crate::topology::{Endpoint, NodeMapping, TopologyRegistry};

use super::session::{run_session, SessionContext};

/// TCP listener proxying one backend node.
pub struct NodeChannel {
    context: Arc<SessionContext>,
    bind_address: String,
    shutdown_tx: broadcast::Sender<()>,
    active_sessions: Arc<AtomicUsize>,
    started: AtomicBool,
}

impl NodeChannel {
    /// Create a channel for one node mapping. The channel does not listen
    /// until [`run`](Self::run) is called.
    #[must_use]
    pub fn new(context: Arc<SessionContext>, bind_address: String) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            context,
            bind_address,
            shutdown_tx,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
        }
    }

    /// The mapping this channel fronts.
    #[must_use]
    pub fn mapping(&self) -> &NodeMapping {
        &self.context.mapping
    }

    /// Get a shutdown handle to signal the channel to stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get the current number of active sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Run the listener, accepting sessions until shutdown.
    ///
    /// Idempotent: a second call returns immediately, so a channel can
    /// never bind its port twice.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the listen address fails.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(node = %self.context.mapping.name, "channel already started");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.bind_address).await?;
        info!(
            node = %self.context.mapping.name,
            bind = %self.bind_address,
            advertised = %self.context.mapping.advertised,
            real = %self.context.mapping.real,
            "proxy channel listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let current = self.active_sessions.load(Ordering::Relaxed);

                            if current >= self.context.listener.max_connections {
                                warn!(
                                    peer = %addr,
                                    active = current,
                                    max = self.context.listener.max_connections,
                                    "session rejected: limit reached"
                                );
                                // Socket is dropped, closing the connection
                                continue;
                            }

                            self.active_sessions.fetch_add(1, Ordering::Relaxed);
                            debug!(peer = %addr, active = current + 1, "accepted session");

                            let context = Arc::clone(&self.context);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let active_sessions = Arc::clone(&self.active_sessions);

                            tokio::spawn(async move {
                                if let Err(e) = run_session(context, socket, shutdown_rx).await {
                                    match &e {
                                        ProxyError::Shutdown => {}
                                        ProxyError::Connection(io_err)
                                            if io_err.kind() == std::io::ErrorKind::UnexpectedEof =>
                                        {
                                            debug!(peer = %addr, "client disconnected");
                                        }
                                        _ => {
                                            error!(peer = %addr, error = %e, "session error");
                                        }
                                    }
                                }
                                active_sessions.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!(node = %self.context.mapping.name, "channel shutdown signal received");
                    break;
                }
            }
        }

        // Stop accepting, then let in-flight sessions drain within the
        // configured bound. The shutdown broadcast has already reached them.
        let drain_deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.context.listener.drain_timeout_ms);
        while self.active_sessions.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= drain_deadline {
                warn!(
                    node = %self.context.mapping.name,
                    active = self.active_sessions.load(Ordering::Relaxed),
                    "drain timeout reached with sessions still active"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(())
    }
}

/// Builds and tracks node channels, one per activated virtual endpoint.
pub struct ChannelManager {
    config: FacadeConfig,
    registry: Arc<TopologyRegistry>,
    rewriter: Arc<CompositeRewriter>,
    strategy: Arc<CertificateStrategy>,
    acceptor: Option<TlsServerAcceptor>,
    metrics: Arc<FacadeMetrics>,
    channels: Mutex<HashMap<Endpoint, Arc<NodeChannel>>>,
}

impl ChannelManager {
    /// Build the manager and all shared wiring from validated configuration.
    ///
    /// Loads TLS and CA key material once; failures here are fatal at
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid topology or unloadable key material.
    pub fn from_config(config: FacadeConfig, metrics: Arc<FacadeMetrics>) -> std::result::Result<Self, StartupError> {
        let registry = Arc::new(config.build_registry()?);
        let rewriter = Arc::new(CompositeRewriter::standard(
            Arc::clone(&registry),
            Arc::clone(&metrics),
        ));
        let strategy = Arc::new(CertificateStrategy::from_config(
            &config.certificate,
            Arc::clone(&metrics),
        )?);
        let acceptor = match &config.upstream_tls {
            Some(tls_config) => Some(TlsServerAcceptor::new(tls_config)?),
            None => None,
        };

        Ok(Self {
            config,
            registry,
            rewriter,
            strategy,
            acceptor,
            metrics,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// The topology registry backing this manager.
    #[must_use]
    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    /// Get or create the channel for a node, starting its listener the
    /// first time.
    ///
    /// Concurrent first references to the same node resolve to the same
    /// channel; only one listener per advertised endpoint ever starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the node name is unknown.
    pub fn activate(&self, name: &str) -> std::result::Result<Arc<NodeChannel>, StartupError> {
        let mapping = self
            .registry
            .resolve_by_name(name)
            .ok_or_else(|| ConfigError::UnknownNode(name.to_string()))?
            .clone();

        let mut channels = self.channels.lock().expect("channel table poisoned");
        if let Some(existing) = channels.get(&mapping.advertised) {
            return Ok(Arc::clone(existing));
        }

        let context = Arc::new(SessionContext::new(
            mapping.clone(),
            Arc::clone(&self.rewriter),
            Arc::clone(&self.strategy),
            self.acceptor.clone(),
            self.config.downstream_tls.clone(),
            Arc::clone(&self.metrics),
            self.config.listener.clone(),
        ));
        let bind_address = self.config.bind_address_for(&mapping.advertised);
        let channel = Arc::new(NodeChannel::new(context, bind_address));
        channels.insert(mapping.advertised.clone(), Arc::clone(&channel));

        let runner = Arc::clone(&channel);
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!(node = %runner.mapping().name, error = %e, "channel failed");
            }
        });

        Ok(channel)
    }

    /// Activate every node the configured selector names.
    ///
    /// # Errors
    ///
    /// Returns an error if a selected node cannot be activated.
    pub fn activate_selected(&self) -> std::result::Result<Vec<Arc<NodeChannel>>, StartupError> {
        self.config
            .selected_nodes()
            .into_iter()
            .map(|node| self.activate(&node.name))
            .collect()
    }

    /// All currently activated channels.
    #[must_use]
    pub fn channels(&self) -> Vec<Arc<NodeChannel>> {
        self.channels
            .lock()
            .expect("channel table poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Signal every channel to stop and wait for sessions to drain, bounded
    /// by the configured drain timeout.
    pub async fn shutdown(&self) {
        let channels = self.channels();
        for channel in &channels {
            let _ = channel.shutdown_handle().send(());
        }

        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.listener.drain_timeout_ms);
        loop {
            let active: usize = channels.iter().map(|c| c.active_sessions()).sum();
            if active == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active, "shutdown drain timeout reached");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!("all channels stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FacadeConfig;

    fn test_config(ports: &[u16]) -> FacadeConfig {
        let nodes: String = ports
            .iter()
            .enumerate()
            .map(|(i, port)| {
                format!(
                    "  - name: broker-{i}\n    real: 10.0.0.{i}:9092\n    advertised: 127.0.0.1:{port}\n"
                )
            })
            .collect();
        FacadeConfig::from_yaml(&format!("listener:\n  bind_host: 127.0.0.1\nnodes:\n{nodes}"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let config = test_config(&[39101]);
        let manager =
            ChannelManager::from_config(config, Arc::new(FacadeMetrics::new())).unwrap();

        let a = manager.activate("broker-0").unwrap();
        let b = manager.activate("broker-0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.channels().len(), 1);
    }

    #[tokio::test]
    async fn test_activate_unknown_node() {
        let config = test_config(&[39102]);
        let manager =
            ChannelManager::from_config(config, Arc::new(FacadeMetrics::new())).unwrap();
        assert!(manager.activate("no-such-node").is_err());
    }

    #[tokio::test]
    async fn test_channel_run_twice_binds_once() {
        let config = test_config(&[39103]);
        let manager =
            ChannelManager::from_config(config, Arc::new(FacadeMetrics::new())).unwrap();
        let channel = manager.activate("broker-0").unwrap();

        // The manager already spawned run(); a direct second run() must be
        // a no-op rather than an address-in-use error.
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.run().await.unwrap();

        let _ = channel.shutdown_handle().send(());
    }

    #[tokio::test]
    async fn test_concurrent_activation_starts_one_listener() {
        let config = test_config(&[39104]);
        let manager = Arc::new(
            ChannelManager::from_config(config, Arc::new(FacadeMetrics::new())).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.activate("broker-0").unwrap()
            }));
        }
        let channels: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        for pair in channels.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
        manager.shutdown().await;
    }
}
