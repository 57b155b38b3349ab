//! PoR node
//!
//! Joins a peer network over TCP and runs liveness checks against every
//! PoR-capable peer it connects to.

use clap::Parser;
use porlink::{identity, spawn_node, Config, PorEvent};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "porlink", version, about = "Proof-of-Response peer node")]
struct Args {
    /// JSON config file ({"network": {...}})
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Boot nodes (ip:port), comma separated
    #[arg(short, long, value_delimiter = ',')]
    boot_nodes: Vec<String>,

    /// Run the PoR protocol
    #[arg(long)]
    por_enabled: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("porlink=info,por=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                return;
            }
        },
        None => Config::default(),
    };

    let net = &mut config.network;
    if let Some(port) = args.port {
        net.listen_port = port;
    }
    if let Some(dir) = args.data_dir {
        net.data_dir = dir;
    }
    if !args.boot_nodes.is_empty() {
        net.boot_nodes = args.boot_nodes;
    }
    net.por_enabled |= args.por_enabled;

    if let Err(e) = net.validate() {
        error!("{}", e);
        return;
    }

    let local_id = match identity::load_or_generate(&net.data_dir) {
        Ok(id) => id,
        Err(e) => {
            error!("Failed to load node identity: {}", e);
            return;
        }
    };

    info!("Starting PoR node {} (por_enabled: {})", local_id, net.por_enabled);

    let node = match spawn_node(net, local_id).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start network: {}", e);
            return;
        }
    };

    info!("Listening on {}", node.local_addr());
    info!("Press Ctrl+C to stop.");

    let mut events = node.node.subscribe();

    tokio::select! {
        _ = async {
            loop {
                match events.recv().await {
                    Ok(PorEvent::Completed { peer, rtt, .. }) => {
                        debug!("PoR check with {} completed in {:?}", peer, rtt);
                    }
                    Ok(PorEvent::TimedOut { peer, attempts, .. }) => {
                        warn!("Peer {} did not answer {} PoR requests", peer, attempts);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        debug!("Event log lagged by {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    node.shutdown().await;

    match serde_json::to_string(&node.node.counters()) {
        Ok(json) => info!("Counters: {}", json),
        Err(e) => warn!("Failed to serialize counters: {}", e),
    }
}
