//! PairDB - Two-Node Replicated Data Store
//!
//! Runs one process of a pair: a data node, or the data-less arbiter
//! that breaks ties between the two.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairdb::arbiter::ArbiterService;
use pairdb::config::PairDbConfig;
use pairdb::error::{Error, Result};
use pairdb::net::{NetClient, NetServer};
use pairdb::node::PairNode;
use pairdb::replication::Message;
use pairdb::storage::MemoryStore;

/// PairDB - Two-Node Replicated Data Store
#[derive(Parser)]
#[command(name = "pairdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pairdb.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a data node of the pair
    Start,

    /// Start the arbiter process
    Arbiter {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7500")]
        bind: String,
    },

    /// Query the status of a running process
    Status {
        /// Process address to query (data node or arbiter)
        #[arg(short, long, default_value = "localhost:7501")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "pairdb.toml")]
        output: PathBuf,

        /// This node's bind address
        #[arg(long, default_value = "0.0.0.0:7501")]
        bind: String,

        /// Peer data node address
        #[arg(long, default_value = "peer.example.com:7501")]
        peer: String,

        /// Arbiter address
        #[arg(long, default_value = "arbiter.example.com:7500")]
        arbiter: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Arbiter { bind } => run_arbiter(bind).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, bind, peer, arbiter } => {
            run_init(output, bind, peer, arbiter)
        }
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a data node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting PairDB data node...");

    let config = match PairDbConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    let storage = MemoryStore::handle();
    let node = PairNode::start(config, storage).await?;
    tracing::info!("Data node running on {}", node.address());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    node.shutdown();

    tracing::info!("PairDB shutdown complete");
    Ok(())
}

/// Start the arbiter
async fn run_arbiter(bind: String) -> Result<()> {
    tracing::info!("Starting PairDB arbiter on {}...", bind);

    let arbiter = ArbiterService::new(bind.clone());
    let server = Arc::new(NetServer::new(bind, arbiter));
    let listener = server.bind().await?;

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                tracing::error!("Arbiter server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.shutdown();
        }
    }

    tracing::info!("Arbiter shutdown complete");
    Ok(())
}

/// Query the status of a running process
async fn run_status(address: String) -> Result<()> {
    let client = NetClient::new(Duration::from_secs(5), Duration::from_secs(10));

    match client.request(&address, Message::StatusRequest).await {
        Ok(Message::StatusReply(status)) => {
            let rendered = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
        Ok(other) => {
            eprintln!("Unexpected response: {}", other.type_name());
            Err(Error::UnexpectedResponse(other.type_name().to_string()))
        }
        Err(e) => {
            eprintln!("Failed to get status from {}: {}", address, e);
            Err(e)
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, bind: String, peer: String, arbiter: String) -> Result<()> {
    let config = PairDbConfig::example(&bind, &peer, &arbiter);
    std::fs::write(&output, config.to_toml()?)?;

    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the peer and arbiter addresses.");
    println!("Then start with: pairdb start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match PairDbConfig::load(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Bind Address:    {}", config.node.bind_address);
            println!("  Advertise:       {}", config.node.self_address());
            println!("  Peer:            {}", config.pair.peer_address);
            println!("  Arbiter:         {}", config.pair.arbiter_address);
            println!("  Heartbeat:       {} ms", config.pair.heartbeat_interval_ms);
            println!("  Liveness Window: {} ms", config.pair.liveness_window_ms);
            println!("  Oplog Entries:   {}", config.oplog.max_entries);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
