//! The quay hub server binary.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use quay_hub::{Hub, HubConfig};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quay-hub", version, about = "Rendezvous hub for quay peers")]
struct Cli {
    /// Address to listen on; overrides the config file.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Address direct-socket listeners bind to; overrides the config file.
    #[arg(long)]
    direct_bind: Option<IpAddr>,

    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut cfg = match &cli.config {
        Some(path) => HubConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HubConfig::default(),
    };
    if let Some(bind) = cli.bind {
        cfg.bind = bind;
    }
    if let Some(direct_bind) = cli.direct_bind {
        cfg.direct_bind = Some(direct_bind);
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "quay-hub starting");
    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    let hub = Hub::new(cfg);
    hub.serve(listener).await.context("accept loop failed")
}
