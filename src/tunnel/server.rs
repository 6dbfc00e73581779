//! Tunnel server
//!
//! Per connection: `accepted -> authenticating -> proxying -> closed`, or
//! `accepted -> rejected` when the server is at capacity.

use super::{accept_error_pause, proxy, ConnectionPool, TunnelError};
use crate::auth::{self, AuthError, Authenticator};
use crate::config::{AuthConfig, ServerConfig};
use crate::transport::{self, tls, TransportConfig, TransportStream};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// A live tunnel-side connection
struct ConnectionEntry {
    peer: SocketAddr,
    /// Cancelling this closes the connection
    cancel: CancellationToken,
}

/// Accepts tunnel connections and forwards them to the FTP server
pub struct TunnelServer {
    config: ServerConfig,
    auth_enabled: bool,
    authenticator: Authenticator,
    tls: Option<TlsAcceptor>,
    pool: ConnectionPool,
    registry: Mutex<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    tracker: TaskTracker,
}

impl TunnelServer {
    /// Create a server for `config`; TLS is off until [`with_tls`](Self::with_tls)
    pub fn new(config: ServerConfig, auth: &AuthConfig) -> Self {
        let pool = ConnectionPool::new(
            config.ftp_server_addr.clone(),
            config.pool_size,
            TransportConfig {
                connect_timeout: config.timeout(),
                keepalive: config.keepalive(),
            },
        );

        Self {
            auth_enabled: auth.enabled,
            authenticator: Authenticator::new(auth.password_hash.clone()),
            tls: None,
            pool,
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            tracker: TaskTracker::new(),
            config,
        }
    }

    /// Terminate TLS on every inbound connection
    pub fn with_tls(mut self, tls_config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(tls_config));
        self
    }

    /// Number of live tunnel connections
    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }

    /// Run the accept loop until `cancel` fires
    ///
    /// On return every connection has been closed and every handler task has
    /// finished.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        info!(
            listen = ?listener.local_addr().ok(),
            upstream = %self.pool.target(),
            auth = self.auth_enabled,
            tls = self.tls.is_some(),
            "tunnel server started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer, &cancel),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        accept_error_pause(&cancel).await;
                    }
                },
            }
        }

        drop(listener);
        self.shutdown().await;
        info!("tunnel server stopped");
        Ok(())
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let Some((id, conn_cancel)) = self.register(peer, cancel) else {
            warn!(
                %peer,
                max_connections = self.config.max_connections,
                "connection rejected: at capacity"
            );
            drop(stream);
            return;
        };

        debug!(conn_id = id, %peer, "connection accepted");
        let server = Arc::clone(self);
        self.tracker.spawn(async move {
            server.handle_connection(id, stream, peer, conn_cancel).await;
        });
    }

    /// Admission check and registration under one lock
    fn register(
        &self,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> Option<(u64, CancellationToken)> {
        let mut registry = self.registry();
        let max = self.config.max_connections;
        if max > 0 && registry.len() >= max {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn_cancel = cancel.child_token();
        registry.insert(
            id,
            ConnectionEntry {
                peer,
                cancel: conn_cancel.clone(),
            },
        );
        Some((id, conn_cancel))
    }

    fn unregister(&self, id: u64) {
        self.registry().remove(&id);
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u64, ConnectionEntry>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn handle_connection(
        &self,
        id: u64,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            r = self.run_session(id, stream, &cancel) => r,
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        };

        match result {
            Ok(()) => info!(conn_id = id, %peer, "connection closed"),
            Err(TunnelError::Auth(AuthError::AuthFailed)) => {
                warn!(conn_id = id, %peer, "authentication failed")
            }
            Err(TunnelError::Cancelled) => debug!(conn_id = id, %peer, "connection closed on shutdown"),
            Err(e) => warn!(conn_id = id, %peer, error = %e, "connection failed"),
        }

        self.unregister(id);
    }

    async fn run_session(
        &self,
        id: u64,
        stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let timeout = self.config.timeout();
        transport::configure_socket(&stream, self.config.keepalive());

        let mut tunnel = match &self.tls {
            Some(acceptor) => tls::accept(acceptor, stream, timeout).await?,
            None => TransportStream::from(stream),
        };

        if self.auth_enabled {
            auth::server_handshake(&mut tunnel, &self.authenticator, timeout).await?;
            debug!(conn_id = id, "client authenticated");
        }

        let mut upstream = if timeout.is_zero() {
            self.pool.acquire(cancel).await?
        } else {
            tokio::time::timeout(timeout, self.pool.acquire(cancel))
                .await
                .map_err(|_| TunnelError::AcquireTimeout)??
        };
        info!(
            conn_id = id,
            upstream = %self.pool.target(),
            upstream_addr = ?upstream.peer_addr().ok(),
            tls = tunnel.is_tls(),
            "proxying"
        );

        let result = proxy(&mut tunnel, &mut upstream, self.config.idle_timeout()).await;
        self.pool.release(upstream, result.is_ok()).await;
        result.map_err(TunnelError::from)
    }

    /// Close every registered connection and wait for all handlers
    async fn shutdown(&self) {
        self.pool.close();

        let entries: Vec<(u64, ConnectionEntry)> = self.registry().drain().collect();
        for (id, entry) in entries {
            debug!(conn_id = id, peer = %entry.peer, "closing connection");
            entry.cancel.cancel();
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use crate::protocol::{self, Message, MessageType, AUTH_OK};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn server_config(upstream: String) -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ftp_server_addr: upstream,
            timeout_ms: 5_000,
            idle_timeout_ms: 10_000,
            ..ServerConfig::default()
        }
    }

    async fn start(
        server: TunnelServer,
    ) -> (Arc<TunnelServer>, SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<(), TunnelError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(server);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&server).serve(listener, cancel.clone()));
        (server, addr, cancel, handle)
    }

    #[tokio::test]
    async fn test_server_handshake_and_proxy() {
        let upstream = echo_upstream().await;
        let auth = AuthConfig {
            enabled: true,
            password_hash: hash_password("secret").unwrap(),
        };
        let (server, addr, cancel, handle) =
            start(TunnelServer::new(server_config(upstream), &auth)).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        protocol::write_message(&mut conn, &Message::auth("secret"))
            .await
            .unwrap();
        let response = protocol::decode(&mut conn).await.unwrap();
        assert_eq!(response.message_type, MessageType::AuthResponse);
        assert_eq!(response.payload.as_ref(), AUTH_OK);

        conn.write_all(b"PWD\r\n").await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PWD\r\n");
        assert_eq!(server.connection_count(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(server.connection_count(), 0);

        // Shutdown closed the tunnel connection
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_bad_password() {
        let upstream = echo_upstream().await;
        let auth = AuthConfig {
            enabled: true,
            password_hash: hash_password("secret").unwrap(),
        };
        let (server, addr, cancel, handle) =
            start(TunnelServer::new(server_config(upstream), &auth)).await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        protocol::write_message(&mut conn, &Message::auth("guess"))
            .await
            .unwrap();
        let response = protocol::decode(&mut conn).await.unwrap();
        assert_ne!(response.payload.as_ref(), AUTH_OK);

        // Connection is dropped after the rejection frame
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest).await;
        assert!(rest.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_without_auth() {
        let upstream = echo_upstream().await;
        let (_server, addr, cancel, handle) = start(TunnelServer::new(
            server_config(upstream),
            &AuthConfig::default(),
        ))
        .await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"raw bytes").await.unwrap();
        let mut buf = [0u8; 9];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw bytes");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_end_returns_upstream_slot() {
        let upstream = echo_upstream().await;
        let config = ServerConfig {
            pool_size: 1,
            ..server_config(upstream)
        };
        let (server, addr, cancel, handle) =
            start(TunnelServer::new(config, &AuthConfig::default())).await;

        for _ in 0..2 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            conn.write_all(b"NOOP").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(server.pool.available(), 0);
            drop(conn);

            // Clean EOF ends the session and releases the upstream
            while server.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(server.pool.available(), 1);
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_admission_control() {
        let upstream = echo_upstream().await;
        let config = ServerConfig {
            max_connections: 1,
            ..server_config(upstream)
        };
        let (server, addr, cancel, handle) =
            start(TunnelServer::new(config, &AuthConfig::default())).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(server.connection_count(), 1);

        // Second connection is closed without being served
        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        let _ = second.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        assert_eq!(server.connection_count(), 1);

        // The first connection is unaffected
        first.write_all(b"ok").await.unwrap();
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_upstream_fails_connection_only() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let (server, addr, cancel, handle) = start(TunnelServer::new(
            server_config(dead_addr),
            &AuthConfig::default(),
        ))
        .await;

        for _ in 0..2 {
            let mut conn = TcpStream::connect(addr).await.unwrap();
            let mut rest = Vec::new();
            let _ = conn.read_to_end(&mut rest).await;
            assert!(rest.is_empty());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
