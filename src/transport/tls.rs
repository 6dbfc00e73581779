//! TLS wrapping for the tunnel link
//!
//! The server presents a PEM certificate chain. The client verifies it in one
//! of three ways:
//! - system roots plus an optional CA file (default)
//! - a pinned SHA-256 fingerprint of the leaf certificate
//! - not at all (`insecure_skip_verify`, testing only)

use super::{with_timeout, TransportError, TransportStream};
use crate::config::TlsConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Length of a SHA-256 certificate fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 32;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: rustls::Error) -> TransportError {
    TransportError::Tls(e.to_string())
}

/// Load TLS certificate chain from PEM file
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open cert file {}: {}", path, e))
    })?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "No certificates found in {}",
            path
        )));
    }
    debug!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load TLS private key from PEM file
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TransportError::Certificate(format!("Failed to open key file {}: {}", path, e))
    })?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| TransportError::Certificate(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Certificate(format!("No private key found in {}", path)))
}

/// Build the server-side TLS configuration from a PEM cert/key pair
pub fn server_config(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_error)?;

    info!("TLS enabled with cert: {}", cert_file);
    Ok(Arc::new(config))
}

/// Build the client-side TLS configuration
pub fn client_config(tls: &TlsConfig) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let config = if let Some(fingerprint) = tls.cert_fingerprint.as_deref() {
        let expected = parse_fingerprint(fingerprint)?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
                fingerprint: Some(expected),
                provider,
            }))
            .with_no_client_auth()
    } else if tls.insecure_skip_verify {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
                fingerprint: None,
                provider,
            }))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        let (added, _) = roots.add_parsable_certificates(native.certs);
        debug!("Loaded {} system root certificate(s)", added);

        if let Some(ca_file) = tls.ca_file.as_deref() {
            for cert in load_certs(ca_file)? {
                roots.add(cert).map_err(tls_error)?;
            }
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Pick the name the client verifies the server certificate against
///
/// Uses `tls.server_name` when set, else the host part of `tunnel_addr`.
pub fn server_name(tls: &TlsConfig, tunnel_addr: &str) -> Result<ServerName<'static>, TransportError> {
    let host = match tls.server_name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => host_of(tunnel_addr),
    };
    ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::InvalidServerName(format!("{}: {}", host, e)))
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Parse a hex SHA-256 fingerprint, with or without `:` separators
pub fn parse_fingerprint(fingerprint: &str) -> Result<Vec<u8>, TransportError> {
    let cleaned: String = fingerprint
        .chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_lowercase();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| TransportError::Certificate(format!("decode fingerprint: {}", e)))?;
    if bytes.len() != FINGERPRINT_LEN {
        return Err(TransportError::Certificate(format!(
            "fingerprint must be {} bytes",
            FINGERPRINT_LEN
        )));
    }
    Ok(bytes)
}

/// SHA-256 fingerprint of a DER certificate
pub fn fingerprint(cert: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, cert)
        .as_ref()
        .to_vec()
}

/// Accept a TLS session on an inbound socket
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TransportStream, TransportError> {
    let tls_stream = with_timeout(timeout, async {
        acceptor.accept(stream).await.map_err(TransportError::Io)
    })
    .await?;
    Ok(TransportStream::Tls(Box::new(tokio_rustls::TlsStream::Server(
        tls_stream,
    ))))
}

/// Perform the client TLS handshake on an outbound socket
pub async fn connect(
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TransportStream, TransportError> {
    let tls_stream = with_timeout(timeout, async {
        connector
            .connect(server_name, stream)
            .await
            .map_err(TransportError::Io)
    })
    .await?;
    Ok(TransportStream::Tls(Box::new(tokio_rustls::TlsStream::Client(
        tls_stream,
    ))))
}

/// Generate a self-signed certificate for a comma-separated host list
///
/// Returns `(cert_pem, key_pem)`. IP hosts become IP SANs, the rest DNS SANs.
pub fn generate_self_signed(hosts: &str) -> Result<(String, String), TransportError> {
    let names: Vec<String> = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(String::from)
        .collect();
    if names.is_empty() {
        return Err(TransportError::Certificate(
            "at least one host is required".to_string(),
        ));
    }

    let cert = rcgen::generate_simple_self_signed(names)
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| TransportError::Certificate(e.to_string()))?;
    let key_pem = cert.serialize_private_key_pem();

    Ok((cert_pem, key_pem))
}

/// Verifier that pins the leaf certificate, or accepts anything when no
/// fingerprint is given. Handshake signatures are still checked.
#[derive(Debug)]
struct PinnedVerifier {
    fingerprint: Option<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.fingerprint {
            Some(expected) if fingerprint(end_entity.as_ref()) != *expected => Err(
                rustls::Error::General("certificate fingerprint mismatch".to_string()),
            ),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
