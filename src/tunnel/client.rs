//! Tunnel client
//!
//! Listens locally for FTP clients. Each local connection gets its own tunnel
//! connection: dial (with retry), authenticate, proxy.

use super::{accept_error_pause, proxy, TunnelError};
use crate::auth;
use crate::config::{AuthConfig, ClientConfig};
use crate::transport::{self, tls, TransportConfig, TransportError, TransportStream};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Local end of the tunnel
pub struct TunnelClient {
    config: ClientConfig,
    auth_enabled: bool,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    running: AtomicBool,
}

/// Clears the running flag when a `start` call ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl TunnelClient {
    /// Create a client for `config`; TLS is off until [`with_tls`](Self::with_tls)
    pub fn new(config: ClientConfig, auth: &AuthConfig) -> Self {
        Self {
            config,
            auth_enabled: auth.enabled,
            tls: None,
            running: AtomicBool::new(false),
        }
    }

    /// Wrap every tunnel connection in TLS, verifying against `server_name`
    pub fn with_tls(
        mut self,
        tls_config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Self {
        self.tls = Some((TlsConnector::from(tls_config), server_name));
        self
    }

    /// Check if a `start` call is in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind `local_host:local_ftp_port` and serve until `cancel` fires
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), TunnelError> {
        let _guard = self.claim()?;
        let local_addr = format!("{}:{}", self.config.local_host, self.config.local_ftp_port);
        let listener = TcpListener::bind(&local_addr).await?;
        self.run(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires
    pub async fn start_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let _guard = self.claim()?;
        self.run(listener, cancel).await
    }

    fn claim(&self) -> Result<RunningGuard<'_>, TunnelError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TunnelError::AlreadyRunning)?;
        Ok(RunningGuard(&self.running))
    }

    async fn run(
        self: &Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        info!(
            listen = ?listener.local_addr().ok(),
            tunnel = %self.config.tunnel_addr,
            auth = self.auth_enabled,
            tls = self.tls.is_some(),
            "tunnel client started"
        );

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((local, peer)) => {
                        debug!(%peer, "local connection accepted");
                        let client = Arc::clone(self);
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            client.handle_local(local, peer, cancel).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        accept_error_pause(&cancel).await;
                    }
                },
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        info!("tunnel client stopped");
        Ok(())
    }

    async fn handle_local(&self, mut local: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let result = tokio::select! {
            r = self.run_session(&mut local, &cancel) => r,
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        };

        match result {
            Ok(()) => info!(%peer, "local connection closed"),
            Err(TunnelError::Cancelled) => debug!(%peer, "local connection closed on shutdown"),
            Err(e) => warn!(%peer, error = %e, "local connection failed"),
        }
    }

    async fn run_session(
        &self,
        local: &mut TcpStream,
        cancel: &CancellationToken,
    ) -> Result<(), TunnelError> {
        let mut remote = self.dial_with_retry(cancel).await?;

        if self.auth_enabled {
            auth::client_handshake(&mut remote, &self.config.password, self.config.timeout())
                .await?;
            debug!("authenticated with tunnel server");
        }

        proxy(local, &mut remote, self.config.idle_timeout()).await?;
        Ok(())
    }

    /// Dial the tunnel server, retrying with capped exponential backoff
    async fn dial_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TransportStream, TunnelError> {
        let attempts = self.config.max_retries.max(1);
        let mut delay = self.config.backoff_initial();
        let max_delay = self.config.backoff_max();
        let mut attempt = 1;

        loop {
            let err = match self.dial_once().await {
                Ok(stream) => {
                    debug!(
                        attempt,
                        tunnel = %self.config.tunnel_addr,
                        remote = ?stream.peer_addr().ok(),
                        tls = stream.is_tls(),
                        "tunnel connected"
                    );
                    return Ok(stream);
                }
                Err(e) => e,
            };
            warn!(attempt, attempts, error = %err, "tunnel dial failed");

            if attempt >= attempts {
                return Err(TunnelError::DialExhausted {
                    attempts,
                    source: err,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_backoff(delay, max_delay);
            attempt += 1;
        }
    }

    async fn dial_once(&self) -> Result<TransportStream, TransportError> {
        let transport_config = TransportConfig {
            connect_timeout: self.config.dial_timeout(),
            keepalive: self.config.keepalive(),
        };
        let stream = transport::connect(&self.config.tunnel_addr, &transport_config).await?;

        match &self.tls {
            Some((connector, server_name)) => {
                tls::connect(
                    connector,
                    server_name.clone(),
                    stream,
                    transport_config.connect_timeout,
                )
                .await
            }
            None => Ok(TransportStream::from(stream)),
        }
    }
}

/// Double `delay`, capped at `max`
fn next_backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}
