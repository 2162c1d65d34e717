// crates/trimatrix-daemon/src/main.rs
//
// Binary entrypoint for the Trimatrix node daemon.
//
// Initializes tracing, parses CLI arguments, loads configuration, opens the
// matrix store, starts the peer network, dials bootstrap peers, and runs
// until ctrl-c triggers a cooperative shutdown.

mod config;

use std::sync::Arc;

use clap::Parser;

use config::DaemonConfig;
use trimatrix_core::TriadStore;
use trimatrix_p2p::{NetworkConfig, PeerNetwork};
use trimatrix_store::MatrixStore;

/// Capacity of the store's domain event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Trimatrix node daemon.
#[derive(Parser, Debug)]
#[command(name = "trimatrix-daemon", version = "0.1.0", about = "Trimatrix node daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "trimatrix.toml")]
    config: String,

    /// Listen address override (e.g. "0.0.0.0:7411").
    #[arg(long)]
    listen: Option<String>,

    /// Bootstrap peer address, repeatable. Appended to the configured list.
    #[arg(long = "peer")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration from TOML file, falling back to defaults if the file
    // is not found.
    let mut daemon_config = match DaemonConfig::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!(
                "Could not load config from {}: {}. Using defaults.",
                args.config, e
            );
            DaemonConfig::default()
        }
    };

    // Initialize tracing subscriber for structured logging. RUST_LOG takes
    // precedence over the configured log level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(daemon_config.log_level.clone())
            }),
        )
        .init();

    // CLI flags override the config file values.
    if let Some(listen) = args.listen {
        daemon_config.listen_addr = listen;
    }
    daemon_config.peers.extend(args.peers);

    tracing::info!("Trimatrix Daemon v0.1.0");
    tracing::info!("Data directory: {}", daemon_config.data_dir);
    tracing::info!("Listen address: {}", daemon_config.listen_addr);

    let db_path = format!("{}/rocksdb", daemon_config.data_dir);
    let store = Arc::new(MatrixStore::open(&db_path, daemon_config.matrix_config())?);
    store.initialize().await?;

    let metadata = store.metadata().await?;
    tracing::info!(
        triads = metadata.triad_count,
        validated = metadata.validated_count,
        validators = metadata.validators.len(),
        "Matrix initialized"
    );

    // Subscribe before the network starts so no created/validated event is
    // dropped between startup and the first broadcast.
    let events = store.subscribe(EVENT_CHANNEL_CAPACITY);

    let network = PeerNetwork::new(
        NetworkConfig {
            listen_addr: daemon_config.listen_addr.clone(),
            advertised_addr: daemon_config.advertised_addr.clone().unwrap_or_default(),
            max_peers: daemon_config.effective_max_peers(),
            ..NetworkConfig::default()
        },
        store.clone() as Arc<dyn TriadStore>,
        None,
    );
    let local_addr = network.start().await?;
    network.spawn_event_pump(events);
    tracing::info!(addr = %local_addr, "Node listening for peers");

    // Dial bootstrap peers. Failures are logged, not fatal; discovery can
    // still reach them later through another peer.
    for peer in &daemon_config.peers {
        match network.connect(peer).await {
            Ok(()) => tracing::info!(peer = %peer, "Bootstrap peer connected"),
            Err(e) => tracing::warn!(peer = %peer, "Bootstrap dial failed: {}", e),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    network.shutdown().await;
    tracing::info!("Trimatrix daemon shut down gracefully");

    Ok(())
}
