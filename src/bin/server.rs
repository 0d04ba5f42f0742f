//! KV server binary
//!
//! Run with: cargo run --bin kv-server -- --help

use anyhow::{Context, Result};
use clap::Parser;
use kv_rendezvous::server::{run_server, ServerConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kv-server")]
#[command(about = "In-memory KV server with eager and rendezvous transfers")]
struct Args {
    /// JSON configuration file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server node ID
    #[arg(long)]
    node_id: Option<u32>,

    /// TCP listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Values at or above this many bytes move by rendezvous
    #[arg(long)]
    eager_threshold: Option<usize>,

    /// Refuse rendezvous; every value travels inline
    #[arg(long, default_value_t = false)]
    no_rendezvous: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of worker threads for processing sessions
    #[arg(long, default_value = "4")]
    worker_threads: usize,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(addr) = &args.listen_addr {
        config.listen_addr = addr.clone();
    }
    if let Some(threshold) = args.eager_threshold {
        config.transport.eager_threshold = threshold;
    }
    if args.no_rendezvous {
        config.transport.rendezvous = false;
    }
    Ok(config)
}

async fn run_with_config(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = load_config(&args)?;

    tracing::info!("=== KV Server Configuration ===");
    tracing::info!("Worker threads: {}", args.worker_threads);
    tracing::info!("Listen address: {}", config.listen_addr);
    tracing::info!("Node ID: {}", config.node_id);
    tracing::info!("Eager threshold: {} bytes", config.transport.eager_threshold);
    tracing::info!(
        "Rendezvous: {}",
        if config.transport.rendezvous { "enabled" } else { "disabled" }
    );
    tracing::info!("===============================");

    run_server(config).await?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let worker_threads = args.worker_threads;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?
        .block_on(run_with_config(args))
}
