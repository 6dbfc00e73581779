//! Transport layer
//!
//! Provides:
//! - TCP dialing with connect timeout, keep-alive and `TCP_NODELAY`
//! - TLS wrapping for both tunnel ends
//! - [`TransportStream`], a byte stream that is either plain TCP or TLS

mod tcp;
pub mod tls;

pub use tcp::{configure_socket, connect};

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Certificate error: {0}")]
    Certificate(String),
}

/// Dial configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout (zero disables)
    pub connect_timeout: Duration,
    /// TCP keepalive idle time (zero disables)
    pub keepalive: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// A tunnel byte stream, plain or TLS-wrapped
pub enum TransportStream {
    /// Raw TCP
    Tcp(TcpStream),
    /// TLS over TCP (either role)
    Tls(Box<tokio_rustls::TlsStream<TcpStream>>),
}

impl TransportStream {
    /// Remote address of the underlying socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Check if the stream is TLS-wrapped
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportStream::Tls(_))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            TransportStream::Tcp(stream) => stream,
            TransportStream::Tls(stream) => stream.get_ref().0,
        }
    }
}

impl From<TcpStream> for TransportStream {
    fn from(stream: TcpStream) -> Self {
        TransportStream::Tcp(stream)
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            TransportStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            TransportStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TransportStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            TransportStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Run `fut` under `timeout`; a zero timeout waits indefinitely
pub(crate) async fn with_timeout<F, T>(timeout: Duration, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransportError::Timeout)?
}
