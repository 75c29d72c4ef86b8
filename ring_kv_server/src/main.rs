use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use ring_kv_core::config::LogLevel;
use ring_kv_core::log::{init_logging, log_shutdown};
use ring_kv_core::shutdown::wait_for_signal;
use ring_kv_core::{
    CacheStrategy, CoordinatorHandle, HashRing, RingConfig, StorageNode, TcpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;

mod client;

#[derive(Parser, Debug)]
#[command(name = "ring_kv", about = "Partitioned, replicated key-value store")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// error, warn, info, debug or trace
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Write logs to this file (rotated daily) instead of stderr
    #[arg(long, global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator on the rendezvous address
    Coordinator {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a storage node
    Node {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Coordinator address as host:port
        #[arg(long)]
        coordinator: Option<String>,
        /// FIFO, LRU, LFU or NONE
        #[arg(long)]
        cache_strategy: Option<CacheStrategy>,
        #[arg(long)]
        cache_size: Option<usize>,
        #[arg(long)]
        storage_dir: Option<String>,
    },
    /// Interactive client
    Client {
        /// Any node's host:port
        #[arg(long, default_value = "127.0.0.1:5000")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RingConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RingConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(path) = cli.log_file {
        config.logging.file_path = Some(path);
    }

    match cli.command {
        Command::Client { server } => client::run_client(&server).await,
        Command::Coordinator { host, port } => {
            if let Some(host) = host {
                config.coordinator.host = host;
            }
            if let Some(port) = port {
                config.coordinator.port = port;
            }
            run_coordinator(config).await
        }
        Command::Node {
            host,
            port,
            coordinator,
            cache_strategy,
            cache_size,
            storage_dir,
        } => {
            if let Some(host) = host {
                config.node.host = host;
            }
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(address) = coordinator {
                let (host, port) = address
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("coordinator address must be host:port"))?;
                config.coordinator.host = host.to_string();
                config.coordinator.port = port.parse().context("coordinator port")?;
            }
            if let Some(strategy) = cache_strategy {
                config.cache.strategy = strategy;
            }
            if let Some(size) = cache_size {
                config.cache.capacity = size;
            }
            if let Some(dir) = storage_dir {
                config.node.storage_dir = dir;
            }
            run_node(config).await
        }
    }
}

fn validate(config: &RingConfig) -> anyhow::Result<()> {
    config
        .validate()
        .map_err(|errors| anyhow!("invalid configuration: {}", errors.join("; ")))
}

async fn run_coordinator(config: RingConfig) -> anyhow::Result<()> {
    validate(&config)?;
    let _guard = init_logging(&config.logging)?;

    println!("Starting coordinator on {}", config.coordinator_address());
    let transport = Arc::new(TcpTransport::with_max_line_bytes(config.network.max_line_bytes));
    let handle = CoordinatorHandle::bind(config, transport, HashRing::new())
        .await
        .context("binding coordinator address")?;

    let signal = wait_for_signal().await;
    log_shutdown(signal.reason());
    let snapshot = handle.coordinator().metrics().snapshot();
    tracing::info!(
        "Coordinator stopping: {} migrations completed, {} failed, {} nodes dropped",
        snapshot.migrations_completed,
        snapshot.migrations_failed,
        snapshot.heartbeats_missed
    );
    handle.stop();
    Ok(())
}

async fn run_node(config: RingConfig) -> anyhow::Result<()> {
    validate(&config)?;
    let _guard = init_logging(&config.logging)?;

    println!(
        "Starting storage node on {} (coordinator {})",
        config.node_address(),
        config.coordinator_address()
    );
    let transport = Arc::new(TcpTransport::with_max_line_bytes(config.network.max_line_bytes));
    let node = StorageNode::bind(config, transport)
        .await
        .context("starting storage node")?;
    println!("Node {} registered", node.name());

    let signal = wait_for_signal().await;
    log_shutdown(signal.reason());
    if let Err(e) = node.shutdown().await {
        tracing::warn!("Graceful leave failed: {}", e);
    }
    let snapshot = node.metrics().snapshot();
    tracing::info!(
        "Node stopping after {} gets, {} puts, {} deletes (hit ratio {:.2})",
        snapshot.gets,
        snapshot.puts,
        snapshot.deletes,
        snapshot.cache_hit_ratio
    );
    Ok(())
}
