//! Upstream connection pool
//!
//! Not a reuse cache: every connection handed out is freshly dialed and closed
//! on release. The pool only caps how many upstream sockets exist at once.

use super::TunnelError;
use crate::transport::{self, TransportConfig};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded dialer for the fixed upstream target
#[derive(Debug)]
pub struct ConnectionPool {
    target: String,
    config: TransportConfig,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl ConnectionPool {
    /// Create a pool of `capacity` slots (0 is treated as 1)
    pub fn new(target: impl Into<String>, capacity: usize, config: TransportConfig) -> Self {
        let capacity = capacity.max(1);
        Self {
            target: target.into(),
            config,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Upstream address this pool dials
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot, then dial the upstream target
    ///
    /// Cancellation only aborts the wait; the dial itself is bounded by the
    /// connect timeout. A failed dial frees its slot before returning.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledConnection, TunnelError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| TunnelError::PoolClosed)?
            }
        };

        let stream = transport::connect(&self.target, &self.config).await?;
        debug!(upstream = %self.target, available = self.available(), "upstream connected");

        Ok(PooledConnection {
            stream,
            _permit: permit,
        })
    }

    /// Close `conn` and free its slot
    ///
    /// Connections are never reused; `keep` has no effect yet.
    pub async fn release(&self, mut conn: PooledConnection, keep: bool) {
        trace!(keep, "releasing upstream connection");
        conn.stream.shutdown().await.ok();
    }

    /// Stop handing out slots. Pending and future `acquire` calls fail with
    /// [`TunnelError::PoolClosed`]; connections still held release normally.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Check if [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// An upstream connection holding one pool slot
///
/// The slot is freed when this value is dropped, so a slot can never be
/// released twice.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Remote address of the upstream socket
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
