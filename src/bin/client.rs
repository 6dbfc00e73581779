//! Falcon Tunnel Client
//!
//! The local tunnel endpoint. FTP clients connect to the local port; each
//! connection is carried to the tunnel server over its own tunnel link.

use anyhow::{Context, Result};
use clap::Parser;
use falcon_tunnel::{
    config::{Config, Overrides},
    logging,
    transport::tls,
    tunnel::TunnelClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Falcon Tunnel Client - local FTP endpoint of the tunnel
#[derive(Parser, Debug)]
#[command(name = "falcon-client")]
#[command(about = "Falcon Tunnel Client - local FTP endpoint of the tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::build(args.config.as_deref(), &args.overrides)
        .context("Failed to load configuration")?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    config
        .validate_client()
        .context("Invalid client configuration")?;

    logging::init(&config.logging).context("Failed to initialize logging")?;

    let mut client = TunnelClient::new(config.client.clone(), &config.auth);
    if config.tls.enabled {
        let tls_config =
            tls::client_config(&config.tls).context("Failed to build TLS client config")?;
        let server_name = tls::server_name(&config.tls, &config.client.tunnel_addr)
            .context("Invalid TLS server name")?;
        client = client.with_tls(tls_config, server_name);
    }

    info!("Falcon Tunnel Client v{}", falcon_tunnel::VERSION);
    info!(
        "Local FTP endpoint {}:{} -> {}",
        config.client.local_host, config.client.local_ftp_port, config.client.tunnel_addr
    );

    let cancel = CancellationToken::new();
    let mut run = tokio::spawn(Arc::new(client).start(cancel.clone()));

    tokio::select! {
        result = &mut run => {
            // Only returns early if the listener could not be set up
            if let Err(e) = result? {
                error!("Client stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("Shutting down...");
            cancel.cancel();
            run.await??;
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
