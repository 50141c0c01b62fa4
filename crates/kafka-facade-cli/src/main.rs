//! Kafka Facade CLI
//!
//! A topology-concealing TCP proxy for Kafka clusters: clients connect to
//! per-node virtual endpoints and never learn the real broker addresses.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_facade_core::ca::bootstrap_root;
use kafka_facade_core::config::{FacadeConfig, LoggingConfig};
use kafka_facade_core::metrics::FacadeMetrics;
use kafka_facade_core::net::ChannelManager;
use kafka_facade_core::SignatureAlgorithm;

/// Topology-concealing Kafka proxy.
#[derive(Parser)]
#[command(name = "kafka-facade")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "facade.yaml")]
    config: String,

    /// Override the local bind host for all listeners.
    #[arg(long)]
    bind_host: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy (the default when no subcommand is given).
    Run,

    /// Self-sign a CA root certificate for the impersonation strategy.
    ///
    /// One-time bootstrap for installations without an external CA. The
    /// written certificate is the trust anchor backend nodes must be
    /// configured to trust.
    BootstrapCa {
        /// Common name of the CA subject.
        #[arg(long)]
        common_name: String,

        /// Organization of the CA subject.
        #[arg(long)]
        organization: Option<String>,

        /// Validity of the root certificate in days.
        #[arg(long, default_value_t = 3650)]
        days: i64,

        /// Where to write the CA certificate (PEM).
        #[arg(long)]
        out_cert: PathBuf,

        /// Where to write the CA private key (PEM).
        #[arg(long)]
        out_key: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::BootstrapCa {
        common_name,
        organization,
        days,
        out_cert,
        out_key,
    }) = &args.command
    {
        return bootstrap_ca(common_name, organization.as_deref(), *days, out_cert, out_key);
    }

    // Load configuration
    let mut config = FacadeConfig::from_file(&args.config)?;

    // Apply CLI overrides
    if let Some(bind_host) = args.bind_host {
        config.listener.bind_host = bind_host;
    }

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        nodes = config.nodes.len(),
        active = config.selected_nodes().len(),
        upstream_tls = config.upstream_tls.is_some(),
        downstream_tls = config.downstream_tls.is_some(),
        "starting kafka facade"
    );

    // Run the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_proxy(config).await })
}

fn bootstrap_ca(
    common_name: &str,
    organization: Option<&str>,
    days: i64,
    out_cert: &PathBuf,
    out_key: &PathBuf,
) -> anyhow::Result<()> {
    let root = bootstrap_root(
        common_name,
        organization,
        days,
        SignatureAlgorithm::RsaSha256,
    )?;
    std::fs::write(out_cert, root.cert_pem)?;
    std::fs::write(out_key, root.key_pem)?;
    println!(
        "wrote CA certificate to {} and key to {}",
        out_cert.display(),
        out_key.display()
    );
    println!("configure backend nodes to trust this certificate");
    Ok(())
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_proxy(config: FacadeConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(FacadeMetrics::new());
    let metrics_config = config.metrics.clone();
    let drain_timeout_ms = config.listener.drain_timeout_ms;

    let manager = Arc::new(ChannelManager::from_config(config, Arc::clone(&metrics))?);
    let channels = manager.activate_selected()?;
    for channel in &channels {
        info!(
            node = %channel.mapping().name,
            advertised = %channel.mapping().advertised,
            real = %channel.mapping().real,
            "node channel active"
        );
    }

    // Start metrics server if enabled
    if metrics_config.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = metrics_config.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
        info!(address = %metrics_config.address, "metrics server started");
    }

    shutdown_signal().await;
    info!("shutdown signal received, stopping proxy");

    // Stop accepting and wait for in-flight sessions, bounded.
    tokio::time::timeout(
        std::time::Duration::from_millis(drain_timeout_ms * 2),
        manager.shutdown(),
    )
    .await
    .ok();

    info!("proxy shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<FacadeMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
