//! Falcon Tunnel TLS certificate generator
//!
//! Writes a self-signed certificate and key for the tunnel server and prints
//! the SHA-256 fingerprint clients can pin.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use falcon_tunnel::transport::tls;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate a self-signed certificate for falcon-server
#[derive(Parser, Debug)]
#[command(name = "falcon-tlsgen")]
#[command(version)]
struct Args {
    /// Comma-separated hostnames or IPs for the certificate
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Output certificate path
    #[arg(long, default_value = "cert.pem")]
    cert: PathBuf,

    /// Output private key path
    #[arg(long, default_value = "key.pem")]
    key: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (cert_pem, key_pem) =
        tls::generate_self_signed(&args.host).context("Failed to generate certificate")?;

    std::fs::write(&args.cert, &cert_pem)
        .with_context(|| format!("Failed to write {}", args.cert.display()))?;
    write_private(&args.key, key_pem.as_bytes())
        .with_context(|| format!("Failed to write {}", args.key.display()))?;

    let cert_path = args.cert.to_string_lossy();
    let leaf = tls::load_certs(&cert_path)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No certificate written"))?;

    println!("Wrote cert: {}", args.cert.display());
    println!("Wrote key:  {}", args.key.display());
    println!("Hosts:      {}", args.host);
    println!("SHA-256:    {}", hex::encode(tls::fingerprint(leaf.as_ref())));

    Ok(())
}

/// Write a key file readable only by its owner
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(contents)
}
