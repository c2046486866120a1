//! # Hypergraph Storage Node
//!
//! Runs one member of a hypergraph storage cluster: loads the configuration,
//! opens the local store, joins the seed peers and serves the peer protocol.
//!
//! ```bash
//! # Write a default configuration
//! hypergraph-storage-node --config node.toml init-config
//!
//! # Run a second node on another port, seeded from the first
//! hypergraph-storage-node --config node.toml --port 7421 --seed 127.0.0.1:7420
//! ```
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hypergraph_storage_node::api;
use hypergraph_storage_node::config::{ensure_default_config, Config, LoggingConfig};
use hypergraph_storage_node::network::HttpNetworkClient;
use hypergraph_storage_node::storage::{
    DistributedStorageNode, LocalKnowledgeStore, MemoryKnowledgeStore, SqlKnowledgeStore,
};

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Override the node id
    #[arg(long)]
    node_id: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Seed peer as host:port (repeatable)
    #[arg(long = "seed", value_name = "HOST:PORT")]
    seeds: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the storage node (default)
    Run,
    /// Write a default configuration file and exit
    InitConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn LocalKnowledgeStore>> {
    match config.storage.engine.as_str() {
        "memory" => Ok(Arc::new(MemoryKnowledgeStore::default())),
        "sqlite" => {
            let store = SqlKnowledgeStore::open(&config.storage.database_path).with_context(|| {
                format!("opening {}", config.storage.database_path.display())
            })?;
            Ok(Arc::new(store))
        }
        other => bail!("unknown storage engine {:?}", other),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::InitConfig) = cli.command {
        ensure_default_config(&cli.config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        println!("Configuration written to {}", cli.config.display());
        return Ok(());
    }

    let mut config = Config::load(&cli.config).with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(node_id) = cli.node_id {
        config.cluster.node_id = Some(node_id);
    }
    if let Some(port) = cli.port {
        config.cluster.port = port;
    }
    config.cluster.seed_peers.extend(cli.seeds);

    init_tracing(&config.logging);
    info!("Starting hypergraph storage node for cluster {}", config.cluster.cluster_id);

    let store = open_store(&config)?;
    let network = Arc::new(HttpNetworkClient::new(config.cluster.peer_timeout_ms));
    let addr: SocketAddr = format!("{}:{}", config.cluster.host, config.cluster.port)
        .parse()
        .context("invalid listen address")?;

    let node = DistributedStorageNode::new(config.cluster.clone(), store, network)?;
    let app = api::router(Arc::clone(&node));

    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("binding {}", addr))?
        .serve(app.into_make_service());
    info!("Node {} listening on {}", node.node_id(), addr);

    // Serve before announcing so seeds can call back
    let serving = tokio::spawn(server.with_graceful_shutdown(shutdown_signal()));
    node.start().await?;

    match serving.await {
        Ok(Ok(())) => info!("Server stopped"),
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    node.stop().await;
    Ok(())
}
