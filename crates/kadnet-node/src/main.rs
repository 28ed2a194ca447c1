//! kadnet - Kademlia peer-discovery node

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kadnet_core::types::parse_address;
use kadnet_node::{config::Config, Node};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kadnet")]
#[command(about = "Kademlia peer-discovery node", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.kadnet/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Listening port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Seed peer, `host` or `host:port` (overrides config, repeatable)
    #[arg(short, long)]
    seed: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run,

    /// Ask a peer for its identity
    Ping {
        /// Peer address (host:port)
        #[arg(required = true)]
        addr: String,
    },

    /// Show version and effective configuration
    Status,

    /// Initialize configuration
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match &cli.command {
        Commands::Run => {
            let config = load_config(&cli)?;
            run_node(&config).await?;
        }
        Commands::Ping { addr } => {
            let config = load_config(&cli)?;
            let addr = parse_address(addr)?;
            let peer = kadnet_node::ping(&config, addr).await?;
            println!("{} is {}", addr, peer.id);
        }
        Commands::Status => {
            let config = load_config(&cli)?;
            show_status(&config)?;
        }
        Commands::Init => {
            init_config()?;
        }
    }

    Ok(())
}

/// Load the config file if present, then apply command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let path = expand_path(&cli.config);
    let mut config = if path.exists() {
        Config::load(&path)?
    } else {
        warn!("No config at {}, using defaults", path.display());
        Config::default()
    };

    if let Some(port) = cli.port {
        config.network.listen_port = port;
    }
    if !cli.seed.is_empty() {
        config.network.seeds = cli.seed.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run_node(config: &Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let node = Node::start(config, shutdown.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    node.shutdown();

    node.wait().await
}

fn show_status(config: &Config) -> Result<()> {
    println!("kadnet v{}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", kadnet_core::PROTOCOL_VERSION);
    println!();
    print!("{}", toml::to_string_pretty(config)?);

    Ok(())
}

fn init_config() -> Result<()> {
    let config_dir = dirs::home_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
        .join(".kadnet");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        info!("Created config directory: {}", config_dir.display());
    }

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
        return Ok(());
    }

    let toml = toml::to_string_pretty(&Config::default())?;
    std::fs::write(&config_path, toml)?;

    println!("Initialized kadnet at: {}", config_dir.display());

    Ok(())
}

fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
