//! A tunneling HTTP/SOCKS proxy that can carry its traffic either over
//! direct sockets or through HTTP relay workers speaking the event protocol.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use burrow_proto::Registry;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::backend::direct::DirectManager;
use crate::backend::relay::RelayManager;
use crate::backend::ManagerSet;
use crate::config::Config;
use crate::session::serve_connection;

mod backend;
mod config;
mod error;
mod http;
mod selector;
mod session;
mod socks;

#[derive(Debug, Parser)]
#[command(name = "burrow", version, about = "Event-tunneling HTTP/SOCKS proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "burrow.toml")]
    config: PathBuf,

    /// Listen address, overriding the configured one.
    #[arg(short, long)]
    listen: Option<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    let config = Config::load(&args.config)
        .with_context(|| format!("cannot load configuration from {}", args.config.display()))?;
    let address = args.listen.unwrap_or_else(|| config.listen.address.clone());

    let registry =
        Arc::new(Registry::with_core_events().context("cannot build event registry")?);

    let mut managers = ManagerSet::new();
    managers.insert(Arc::new(DirectManager::new(&config.direct)));
    if !config.relay.workers.is_empty() {
        let relay = RelayManager::spawn(Arc::clone(&registry), &config.wire, &config.relay)
            .context("cannot start relay manager")?;
        managers.insert(relay);
    }
    let manager = managers
        .get(&config.proxy.manager)
        .with_context(|| format!("unknown proxy manager {:?}", config.proxy.manager))?;

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot listen on {address}"))?;
    info!(%address, manager = manager.name(), "proxy listening");

    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, peer.to_string(), manager).await {
                debug!(%peer, %error, "session ended with error");
            }
        });
    }
}
