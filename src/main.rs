use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use admitter::config::{AdmissionConfig, CoordinatorConfig};
use admitter::mesh::LocalMesh;
use admitter::{AdaptiveLimiter, DistributedCoordinator, Limiter, SystemClock};

/// Run an in-process admission cluster against synthetic traffic.
#[derive(Debug, Parser)]
#[command(name = "admitter", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of coordinator nodes in the local mesh
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// How long to drive traffic, in seconds
    #[arg(short, long, default_value_t = 5)]
    duration_secs: u64,

    /// Offered requests per second per node
    #[arg(long, default_value_t = 500)]
    offered_rate: u64,

    /// Probability that a simulated downstream call fails
    #[arg(long, default_value_t = 0.05)]
    error_probability: f64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.error_probability),
        "error probability must be within [0, 1]"
    );

    info!("Starting Admitter simulation");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => AdmissionConfig::from_file(path)?,
        None => AdmissionConfig::default(),
    };
    info!(
        nodes = args.nodes,
        total_rate = config.coordinator.total_rate,
        limiters = config.limiters.len(),
        "Configuration loaded"
    );

    let clock = SystemClock::shared();
    let limiters = config.build_limiters(clock.clone());
    let shutdown = CancellationToken::new();

    // Build the mesh
    let mesh = Arc::new(LocalMesh::new());
    let mut nodes = Vec::with_capacity(args.nodes);
    for i in 0..args.nodes {
        let node_config = CoordinatorConfig {
            node_id: format!("{}-{}", config.coordinator.node_id, i),
            node_count: args.nodes as u64,
            ..config.coordinator.clone()
        };
        let node = Arc::new(DistributedCoordinator::with_config(node_config, clock.clone()));
        mesh.register(node.clone());
        nodes.push(node);
    }
    let handles: Vec<_> = nodes
        .iter()
        .map(|node| node.spawn(mesh.clone(), shutdown.clone()))
        .collect();

    let adaptive = Arc::new(AdaptiveLimiter::with_clock(
        config.coordinator.total_rate,
        config.coordinator.total_rate / 10,
        config.coordinator.total_rate.saturating_mul(2),
        Duration::from_secs(1),
        clock.clone(),
    ));

    // Drive traffic
    let admitted: Vec<Arc<AtomicU64>> = nodes.iter().map(|_| Arc::new(AtomicU64::new(0))).collect();
    let tick = (Duration::from_secs(1) / args.offered_rate.clamp(1, 1_000_000) as u32)
        .max(Duration::from_micros(1));
    let mut traffic = Vec::new();
    for (node, counter) in nodes.iter().zip(&admitted) {
        let node = node.clone();
        let counter = counter.clone();
        let adaptive = adaptive.clone();
        let token = shutdown.clone();
        let error_probability = args.error_probability;
        traffic.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if node.allow() && adaptive.allow() {
                            counter.fetch_add(1, Ordering::Relaxed);
                            if rand::thread_rng().gen_bool(error_probability) {
                                adaptive.record_error();
                            } else {
                                adaptive.record_success();
                            }
                        }
                    }
                    _ = token.cancelled() => return,
                }
            }
        }));
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {
            info!("Simulation finished");
        }
        _ = shutdown_signal() => {}
    }
    shutdown.cancel();

    for result in futures::future::join_all(traffic).await {
        if let Err(e) = result {
            warn!(error = %e, "Traffic task failed");
        }
    }
    for handle in handles {
        handle.shutdown().await;
    }

    for (node, counter) in nodes.iter().zip(&admitted) {
        info!(
            node_id = %node.node_id(),
            active_nodes = node.active_nodes(),
            local_share = node.local_share(),
            admitted = counter.load(Ordering::Relaxed),
            "Node summary"
        );
    }
    info!(current_rate = adaptive.current_rate(), "Adaptive limiter summary");
    for (name, limiter) in &limiters {
        info!(limiter = %name, admits_now = limiter.allow(), "Configured limiter probe");
    }

    info!("Admitter simulation stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
