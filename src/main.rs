use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use crowdnode::{config::Config, identity, node::Server, types::Resource};
use libp2p::Multiaddr;
use tracing_subscriber::EnvFilter;

/// crowdnode: discovers compute peers over a Kademlia namespace and keeps
/// track of which of them are healthy.
#[derive(Parser, Debug)]
#[command(name = "crowdnode", version, about)]
struct Cli {
    /// Identity key file (default: ~/.crowdnode/<worker|consumer>.key).
    #[arg(long, env = "CROWDNODE_IDENTITY")]
    identity: Option<PathBuf>,

    /// Multiaddr(s) to listen on.
    #[arg(long, env = "CROWDNODE_LISTEN", value_delimiter = ',')]
    listen: Vec<Multiaddr>,

    /// Bootstrap peer multiaddr(s), each with a /p2p/ component.
    #[arg(long, env = "CROWDNODE_BOOTSTRAP", value_delimiter = ',')]
    bootstrap: Vec<String>,

    /// Use short discovery and health intervals for local meshes.
    #[arg(long, env = "CROWDNODE_SHORT_INTERVALS")]
    short_intervals: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, env = "CROWDNODE_VERBOSE")]
    verbose: bool,

    /// Advertise this node as a worker that serves inference.
    #[arg(long, env = "CROWDNODE_WORKER")]
    worker: bool,

    #[arg(long, env = "CROWDNODE_GPU_MODEL", default_value = "")]
    gpu_model: String,

    #[arg(long, env = "CROWDNODE_VRAM_GB", default_value_t = 0)]
    vram_gb: u32,

    /// Measured generation speed in tokens per second.
    #[arg(long, env = "CROWDNODE_TOKENS_THROUGHPUT", default_value_t = 0.0)]
    tokens_throughput: f64,

    #[arg(long, env = "CROWDNODE_MODELS", value_delimiter = ',')]
    models: Vec<String>,
}

impl Cli {
    fn component(&self) -> &'static str {
        match self.worker {
            true => "worker",
            false => "consumer",
        }
    }

    fn config(&self) -> Config {
        match self.short_intervals {
            true => Config::short_intervals(),
            false => Config::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        true => "debug",
        false => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let identity_path = match &cli.identity {
        Some(path) => path.clone(),
        None => identity::default_key_path(cli.component())?,
    };
    let keypair = identity::load_or_generate(&identity_path)?;
    let peer_id = keypair.public().to_peer_id();

    let resource = Resource::new(
        &peer_id,
        cli.gpu_model.clone(),
        cli.vram_gb,
        cli.tokens_throughput,
        cli.models.clone(),
        cli.worker,
    );

    let server = Server::new(keypair, cli.listen.clone(), cli.config(), resource)
        .context("creating node")?;
    server.bootstrap(&cli.bootstrap).await?;
    let addr = server.start().await?;
    tracing::info!(%addr, component = cli.component(), "node ready");

    if let Err(e) = shutdown_signal().await {
        tracing::error!(error = %e, "shutdown signal listener failed");
    }
    tracing::info!("shutting down");
    server.stop().await;
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .context("installing Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("installing SIGTERM handler")?
            .recv()
            .await;
        Ok(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}
