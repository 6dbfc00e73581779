//! Raw TCP dialing

use super::{with_timeout, TransportConfig, TransportError};
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Connect to `addr` within the configured timeout
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = with_timeout(config.connect_timeout, async {
        TcpStream::connect(addr).await.map_err(TransportError::Io)
    })
    .await?;

    configure_socket(&stream, config.keepalive);
    trace!(addr, "tcp connected");

    Ok(stream)
}

/// Apply `TCP_NODELAY` and keep-alive to a connected socket
///
/// Failures are ignored; these options only tune an already working socket.
pub fn configure_socket(stream: &TcpStream, keepalive: Duration) {
    // Auth frames are tiny; don't let Nagle delay them
    stream.set_nodelay(true).ok();

    if !keepalive.is_zero() {
        let params = TcpKeepalive::new().with_time(keepalive);
        SockRef::from(stream).set_tcp_keepalive(&params).ok();
    }
}
