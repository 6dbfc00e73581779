//! Falcon Tunnel Server
//!
//! The remote tunnel endpoint that:
//! - Accepts tunnel connections, optionally over TLS
//! - Authenticates each one with the password handshake
//! - Forwards the connection to the configured FTP server

use anyhow::{Context, Result};
use clap::Parser;
use falcon_tunnel::{
    config::{Config, Overrides},
    logging,
    transport::tls,
    tunnel::TunnelServer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Falcon Tunnel Server - authenticated FTP tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "falcon-server")]
#[command(about = "Falcon Tunnel Server - authenticated FTP tunnel endpoint")]
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
        .validate_server()
        .context("Invalid server configuration")?;

    logging::init(&config.logging).context("Failed to initialize logging")?;

    let mut server = TunnelServer::new(config.server.clone(), &config.auth);
    if config.tls.enabled {
        let tls_config = tls::server_config(
            config.tls.cert_file.as_deref().unwrap_or_default(),
            config.tls.key_file.as_deref().unwrap_or_default(),
        )
        .context("Failed to build TLS server config")?;
        server = server.with_tls(tls_config);
    } else {
        info!("TLS disabled");
    }
    if !config.auth.enabled {
        warn!("Authentication disabled - anyone reaching the listen address can use the tunnel");
    }

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .context("Failed to bind to address")?;

    info!("Falcon Tunnel Server v{}", falcon_tunnel::VERSION);
    info!("Listening on {}", listener.local_addr()?);
    info!("Forwarding to {}", config.server.ftp_server_addr);

    let cancel = CancellationToken::new();
    let serve = tokio::spawn(Arc::new(server).serve(listener, cancel.clone()));

    shutdown_signal().await;
    info!("Shutting down...");
    cancel.cancel();
    serve.await??;

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
