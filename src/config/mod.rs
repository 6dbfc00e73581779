//! Configuration management
//!
//! Configuration comes from an optional TOML file, then CLI [`Overrides`],
//! then zero values are replaced by defaults and the result is validated for
//! the role (server or client) that will use it.

use crate::auth::{self, AuthError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("server.listen_addr is required")]
    MissingListenAddr,

    #[error("server.ftp_server_addr is required")]
    MissingFtpServerAddr,

    #[error("server.max_connections must be > 0")]
    InvalidMaxConnections,

    #[error("client.tunnel_addr is required")]
    MissingTunnelAddr,

    #[error("client.local_ftp_port must be > 0")]
    MissingLocalFtpPort,

    #[error("client.password is required when auth is enabled")]
    MissingClientPassword,

    #[error("auth.password_hash is required when auth is enabled")]
    MissingPasswordHash,

    #[error("tls.cert_file is required when TLS is enabled")]
    MissingTlsCert,

    #[error("tls.key_file is required when TLS is enabled")]
    MissingTlsKey,

    #[error("timeout must be > 0")]
    InvalidTimeout,

    #[error("hash password: {0}")]
    Hash(#[from] AuthError),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel server settings
    pub server: ServerConfig,
    /// Tunnel client settings
    pub client: ClientConfig,
    /// Shared authentication settings
    pub auth: AuthConfig,
    /// Shared TLS settings
    pub tls: TlsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Ok(toml::from_str(&content)?)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load `path` (or start from defaults), apply `overrides`, fill defaults
    ///
    /// Validation is left to the caller since it depends on the role.
    pub fn build(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        overrides.apply(&mut config)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Replace zero or empty values with defaults
    pub fn apply_defaults(&mut self) {
        let server = ServerConfig::default();
        if self.server.listen_addr.is_empty() {
            self.server.listen_addr = server.listen_addr;
        }
        if self.server.max_connections == 0 {
            self.server.max_connections = server.max_connections;
        }
        if self.server.timeout_ms == 0 {
            self.server.timeout_ms = server.timeout_ms;
        }
        if self.server.pool_size == 0 {
            self.server.pool_size = server.pool_size;
        }

        let client = ClientConfig::default();
        if self.client.local_host.is_empty() {
            self.client.local_host = client.local_host;
        }
        if self.client.local_ftp_port == 0 {
            self.client.local_ftp_port = client.local_ftp_port;
        }
        if self.client.timeout_ms == 0 {
            self.client.timeout_ms = client.timeout_ms;
        }
        if self.client.max_retries == 0 {
            self.client.max_retries = client.max_retries;
        }
        if self.client.backoff_initial_ms == 0 {
            self.client.backoff_initial_ms = client.backoff_initial_ms;
        }
        if self.client.backoff_max_ms == 0 {
            self.client.backoff_max_ms = client.backoff_max_ms;
        }

        let logging = LoggingConfig::default();
        if self.logging.level.is_empty() {
            self.logging.level = logging.level;
        }
        if self.logging.format.is_empty() {
            self.logging.format = logging.format;
        }
    }

    /// Check everything the tunnel server needs
    pub fn validate_server(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.is_empty() {
            return Err(ConfigError::MissingListenAddr);
        }
        if self.server.ftp_server_addr.is_empty() {
            return Err(ConfigError::MissingFtpServerAddr);
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        if self.server.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.auth.enabled && self.auth.password_hash.is_empty() {
            return Err(ConfigError::MissingPasswordHash);
        }
        if self.tls.enabled {
            if self.tls.cert_file.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingTlsCert);
            }
            if self.tls.key_file.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::MissingTlsKey);
            }
        }
        Ok(())
    }

    /// Check everything the tunnel client needs
    pub fn validate_client(&self) -> Result<(), ConfigError> {
        if self.client.tunnel_addr.is_empty() {
            return Err(ConfigError::MissingTunnelAddr);
        }
        if self.client.local_ftp_port == 0 {
            return Err(ConfigError::MissingLocalFtpPort);
        }
        if self.client.timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.auth.enabled && self.client.password.is_empty() {
            return Err(ConfigError::MissingClientPassword);
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Tunnel listen address
    pub listen_addr: String,
    /// Upstream FTP server (host:port)
    pub ftp_server_addr: String,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    /// Handshake, TLS accept, upstream dial and pool wait timeout
    pub timeout_ms: u64,
    /// Close a proxied pair after this long without traffic (0 disables)
    pub idle_timeout_ms: u64,
    /// TCP keep-alive idle time (0 disables)
    pub keepalive_ms: u64,
    /// Maximum concurrent upstream connections
    pub pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            ftp_server_addr: String::new(),
            max_connections: 100,
            timeout_ms: 30_000,
            idle_timeout_ms: 0,
            keepalive_ms: 0,
            pool_size: 10,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    pub tunnel_addr: String,
    /// Local interface FTP clients connect to
    pub local_host: String,
    /// Local FTP port
    pub local_ftp_port: u16,
    /// Dial and handshake timeout
    pub timeout_ms: u64,
    /// Close a proxied pair after this long without traffic (0 disables)
    pub idle_timeout_ms: u64,
    /// TCP keep-alive idle time on the tunnel socket (0 disables)
    pub keepalive_ms: u64,
    /// Plaintext password sent when auth is enabled
    pub password: String,
    /// Dial attempts per local connection
    pub max_retries: u32,
    /// First backoff delay
    pub backoff_initial_ms: u64,
    /// Backoff cap
    pub backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnel_addr: String::new(),
            local_host: "127.0.0.1".to_string(),
            local_ftp_port: 2121,
            timeout_ms: 30_000,
            idle_timeout_ms: 0,
            keepalive_ms: 0,
            password: String::new(),
            max_retries: 1,
            backoff_initial_ms: 500,
            backoff_max_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Connect timeout for one dial attempt; 30s when unset
    pub fn dial_timeout(&self) -> Duration {
        if self.timeout_ms == 0 {
            Duration::from_secs(30)
        } else {
            self.timeout()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// First retry delay; 500ms when unset
    pub fn backoff_initial(&self) -> Duration {
        match self.backoff_initial_ms {
            0 => Duration::from_millis(500),
            ms => Duration::from_millis(ms),
        }
    }

    /// Retry delay cap; 5s when unset
    pub fn backoff_max(&self) -> Duration {
        match self.backoff_max_ms {
            0 => Duration::from_secs(5),
            ms => Duration::from_millis(ms),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require the password handshake on every tunnel connection
    pub enabled: bool,
    /// bcrypt hash the server verifies against
    pub password_hash: String,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Wrap the tunnel link in TLS
    pub enabled: bool,
    /// Server certificate chain (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    /// Server private key (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Extra CA certificates trusted by the client (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Name the client verifies; defaults to the tunnel host
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Skip certificate verification (testing only)
    pub insecure_skip_verify: bool,
    /// Pin the server leaf certificate by SHA-256 (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (text, compact, json)
    pub format: String,
    /// Log file path (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Command-line overrides shared by both binaries
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    /// Server listen address (e.g. 0.0.0.0:8080)
    #[arg(long)]
    pub listen: Option<String>,

    /// Target FTP server address (host:port)
    #[arg(long = "ftp")]
    pub ftp_server: Option<String>,

    /// Maximum concurrent tunnel connections
    #[arg(long = "max-conns")]
    pub max_connections: Option<usize>,

    /// Maximum concurrent upstream connections
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Server timeout in milliseconds
    #[arg(long)]
    pub server_timeout_ms: Option<u64>,

    /// Idle timeout in milliseconds (server and client)
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Tunnel server address (host:port)
    #[arg(long = "server")]
    pub tunnel_addr: Option<String>,

    /// Local FTP port to listen on
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Client timeout in milliseconds
    #[arg(long)]
    pub client_timeout_ms: Option<u64>,

    /// Dial attempts per local connection
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Plaintext password for client authentication
    #[arg(long)]
    pub client_password: Option<String>,

    /// Enable authentication
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub auth: Option<bool>,

    /// Plaintext password (hashed before use)
    #[arg(long)]
    pub password: Option<String>,

    /// Existing bcrypt password hash
    #[arg(long)]
    pub password_hash: Option<String>,

    /// Enable TLS
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub tls: Option<bool>,

    /// TLS certificate file
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// TLS private key file
    #[arg(long)]
    pub tls_key: Option<String>,

    /// CA certificate file trusted by the client
    #[arg(long)]
    pub tls_ca: Option<String>,

    /// Skip TLS certificate verification (testing only)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub tls_insecure: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<String>,

    /// Log format (text, compact, json)
    #[arg(long)]
    pub log_format: Option<String>,
}

impl Overrides {
    /// Apply every override that was given
    pub fn apply(&self, config: &mut Config) -> Result<(), ConfigError> {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }

        set(&mut config.server.listen_addr, &self.listen);
        set(&mut config.server.ftp_server_addr, &self.ftp_server);
        set(&mut config.server.max_connections, &self.max_connections);
        set(&mut config.server.pool_size, &self.pool_size);
        set(&mut config.server.timeout_ms, &self.server_timeout_ms);
        set(&mut config.server.idle_timeout_ms, &self.idle_timeout_ms);

        set(&mut config.client.tunnel_addr, &self.tunnel_addr);
        set(&mut config.client.local_ftp_port, &self.local_port);
        set(&mut config.client.timeout_ms, &self.client_timeout_ms);
        set(&mut config.client.idle_timeout_ms, &self.idle_timeout_ms);
        set(&mut config.client.max_retries, &self.max_retries);
        set(&mut config.client.password, &self.client_password);

        set(&mut config.auth.enabled, &self.auth);
        set(&mut config.auth.password_hash, &self.password_hash);
        if let Some(password) = &self.password {
            config.auth.password_hash = auth::hash_password(password)?;
        }

        set(&mut config.tls.enabled, &self.tls);
        set(&mut config.tls.insecure_skip_verify, &self.tls_insecure);
        if self.tls_cert.is_some() {
            config.tls.cert_file = self.tls_cert.clone();
        }
        if self.tls_key.is_some() {
            config.tls.key_file = self.tls_key.clone();
        }
        if self.tls_ca.is_some() {
            config.tls.ca_file = self.tls_ca.clone();
        }

        set(&mut config.logging.level, &self.log_level);
        set(&mut config.logging.format, &self.log_format);
        if self.log_file.is_some() {
            config.logging.file = self.log_file.clone();
        }

        Ok(())
    }
}
