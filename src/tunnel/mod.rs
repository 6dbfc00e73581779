//! Tunnel layer - the two tunnel endpoints and what they share
//!
//! Provides:
//! - [`ConnectionPool`] bounding concurrent upstream connections
//! - [`proxy`], the bidirectional copy with idle enforcement
//! - [`TunnelServer`], the remote end in front of the FTP server
//! - [`TunnelClient`], the local end FTP clients connect to

mod client;
mod pool;
mod proxy;
mod server;

pub use client::TunnelClient;
pub use pool::{ConnectionPool, PooledConnection};
pub use proxy::proxy;
pub use server::TunnelServer;

use crate::auth::AuthError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Pause after a failed `accept` before polling the listener again
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Connection pool closed")]
    PoolClosed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out waiting for an upstream connection")]
    AcquireTimeout,

    #[error("Tunnel server unreachable after {attempts} attempt(s): {source}")]
    DialExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Tunnel client already running")]
    AlreadyRunning,

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Back off after an accept error (EMFILE and friends persist until a
/// descriptor frees up). Returns early when `cancel` fires.
async fn accept_error_pause(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_ERROR_DELAY) => {}
    }
}
