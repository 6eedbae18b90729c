//! embednet demo host.
//!
//! Brings a node up, echoes every connection it accepts on the overlay, and
//! optionally opens the loopback gateway for other local programs.
//!
//! ```text
//!   overlay peer ──▶ virtual stack ──▶ FlowDispatcher ──▶ Listener ──▶ echo task
//!   local program ──▶ 127.0.0.1:<port> ──▶ SOCKS5 / control API
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use embednet::config::loader::load_config;
use embednet::observability::{logging, metrics};
use embednet::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "embednet")]
#[command(about = "Run an embedded overlay node that echoes inbound connections")]
struct Args {
    /// Node configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overlay address to echo on.
    #[arg(short, long, default_value = ":80")]
    listen: String,

    /// Open the loopback SOCKS5 / control API socket and print its credentials.
    #[arg(long)]
    loopback: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => NodeConfig::default(),
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!("embednet v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let node = Node::new(config);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
            }
            cancel.cancel();
        });
    }

    match node.up(&cancel).await {
        Ok(status) => tracing::info!(
            hostname = %status.hostname,
            addresses = ?status.overlay_ips,
            "Node is up"
        ),
        Err(e) => {
            tracing::error!(error = %e, "Node did not come up");
            node.close().await?;
            return Err(e.into());
        }
    }

    let listener = node.listen("tcp", &args.listen).await?;
    tracing::info!(address = %listener.addr(), "Echoing connections");

    if args.loopback {
        let info = node.loopback().await?;
        println!("loopback address:   {}", info.address);
        println!("proxy credential:   {}", info.proxy_credential);
        println!("control credential: {}", info.control_credential);
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok(mut conn) = accepted else { break };
                let peer = conn.peer_addr();
                tokio::spawn(async move {
                    let copied = {
                        let (mut reader, mut writer) = tokio::io::split(&mut conn);
                        tokio::io::copy(&mut reader, &mut writer).await
                    };
                    match copied {
                        Ok(bytes) => tracing::debug!(peer = %peer, bytes, "Echo finished"),
                        Err(e) => tracing::debug!(peer = %peer, error = %e, "Echo failed"),
                    }
                    let _ = conn.shutdown().await;
                });
            }
        }
    }

    node.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
