//! # Falcon Tunnel
//!
//! An authenticated, optionally TLS-wrapped TCP tunnel for FTP control
//! connections.
//!
//! ## Features
//!
//! - **Password handshake** backed by bcrypt before any byte is proxied
//! - **TLS** with system roots, a private CA, or certificate pinning
//! - **Bounded concurrency** on both the inbound and upstream side
//! - **Idle timeout** tearing down stalled sessions
//!
//! ## Architecture
//!
//! ```text
//!  FTP client ──► TunnelClient ══ tunnel link ══► TunnelServer ──► FTP server
//!                 (local port)   (TCP or TLS,     (admission,
//!                 dial + retry    auth frames,     auth, pool)
//!                                 then raw bytes)
//! ```
//!
//! After the handshake the link carries raw FTP bytes; frames are only used
//! for authentication.

pub mod auth;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Auth error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] logging::LoggingError),
}
