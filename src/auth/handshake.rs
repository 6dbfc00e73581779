//! Password handshake
//!
//! ```text
//! client                      server
//!   | -- Auth{password} -------> |
//!   | <------ AuthResponse{ok} - |   (or "invalid credentials")
//! ```
//!
//! The deadline bounds the whole exchange. It is scoped to the handshake
//! future, so the stream carries no deadline once the call returns.

use super::{AuthError, Authenticator};
use crate::protocol::{self, Message, MessageType, ProtocolError, AUTH_OK, AUTH_REJECTED};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

/// Injectable randomness for [`generate_token`]
pub type RandomSource<'a> = &'a (dyn Fn(&mut [u8]) -> io::Result<()> + Sync);

/// Run the server side of the handshake
///
/// Returns `AuthFailed` after the rejection frame has been sent; the caller
/// must drop the connection.
pub async fn server_handshake<S>(
    stream: &mut S,
    authenticator: &Authenticator,
    deadline: Duration,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    with_deadline(deadline, server_exchange(stream, authenticator)).await
}

/// Run the client side of the handshake
pub async fn client_handshake<S>(
    stream: &mut S,
    password: &str,
    deadline: Duration,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    with_deadline(deadline, client_exchange(stream, password)).await
}

async fn server_exchange<S>(stream: &mut S, authenticator: &Authenticator) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let message = read_frame(stream).await?;
    if message.message_type != MessageType::Auth {
        warn!(message_type = ?message.message_type, "expected auth message");
        return Err(AuthError::InvalidResponse);
    }

    // bcrypt is slow on purpose; keep it off the reactor
    let verifier = authenticator.clone();
    let password = message.payload;
    let accepted = tokio::task::spawn_blocking(move || verifier.authenticate(&password))
        .await
        .unwrap_or(false);

    let verdict = if accepted { AUTH_OK } else { AUTH_REJECTED };
    protocol::write_message(stream, &Message::auth_response(verdict)).await?;

    if accepted {
        debug!("client authenticated");
        Ok(())
    } else {
        Err(AuthError::AuthFailed)
    }
}

async fn client_exchange<S>(stream: &mut S, password: &str) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    protocol::write_message(stream, &Message::auth(password)).await?;

    let response = read_frame(stream).await?;
    if response.message_type != MessageType::AuthResponse {
        return Err(AuthError::InvalidResponse);
    }
    if response.payload.as_ref() != AUTH_OK {
        debug!(
            reason = %String::from_utf8_lossy(&response.payload),
            "server rejected credentials"
        );
        return Err(AuthError::AuthFailed);
    }
    Ok(())
}

// An unknown type tag is just another frame of the wrong type here
async fn read_frame<S>(stream: &mut S) -> Result<Message, AuthError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    match protocol::decode(stream).await {
        Ok(message) => Ok(message),
        Err(ProtocolError::InvalidMessageType(tag)) => {
            warn!(tag, "unknown message type during handshake");
            Err(AuthError::InvalidResponse)
        }
        Err(e) => Err(e.into()),
    }
}

/// Generate a random hex-encoded token of `len` bytes
///
/// `source` defaults to the system CSPRNG.
pub fn generate_token(len: usize, source: Option<RandomSource<'_>>) -> Result<String, AuthError> {
    if len == 0 {
        return Err(AuthError::TokenGeneration(
            "token length must be > 0".to_string(),
        ));
    }

    let mut buf = vec![0u8; len];
    match source {
        Some(fill) => fill(&mut buf),
        None => system_fill(&mut buf),
    }
    .map_err(|e| AuthError::TokenGeneration(e.to_string()))?;

    Ok(hex::encode(buf))
}

fn system_fill(buf: &mut [u8]) -> io::Result<()> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "system randomness unavailable"))
}

async fn with_deadline<F>(deadline: Duration, exchange: F) -> Result<(), AuthError>
where
    F: Future<Output = Result<(), AuthError>>,
{
    if deadline.is_zero() {
        return exchange.await;
    }
    tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| AuthError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::hash_password;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    const DEADLINE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_handshake_success() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, &authenticator, DEADLINE).await
        });

        client_handshake(&mut client, "secret", DEADLINE).await.unwrap();
        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_wrong_password() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, &authenticator, DEADLINE).await
        });

        let client_result = client_handshake(&mut client, "nope", DEADLINE).await;
        assert!(matches!(client_result, Err(AuthError::AuthFailed)));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(AuthError::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_server_sends_rejection_frame() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, &authenticator, DEADLINE).await
        });

        protocol::write_message(&mut client, &Message::auth("nope"))
            .await
            .unwrap();
        let response = protocol::decode(&mut client).await.unwrap();
        assert_eq!(response.message_type, MessageType::AuthResponse);
        assert_eq!(response.payload.as_ref(), AUTH_REJECTED);

        assert!(matches!(
            server_task.await.unwrap(),
            Err(AuthError::AuthFailed)
        ));
    }

    #[tokio::test]
    async fn test_server_rejects_non_auth_message() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let result = server_handshake(&mut server, &authenticator, DEADLINE).await;
            drop(server);
            result
        });

        protocol::write_message(&mut client, &Message::new(MessageType::Data, "hello"))
            .await
            .unwrap();

        assert!(matches!(
            server_task.await.unwrap(),
            Err(AuthError::InvalidResponse)
        ));

        // No response frame is sent for protocol violations
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_client_rejects_non_auth_response() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let _ = protocol::decode(&mut server).await.unwrap();
            protocol::write_message(&mut server, &Message::new(MessageType::Data, "ok"))
                .await
                .unwrap();
        });

        let result = client_handshake(&mut client, "secret", DEADLINE).await;
        assert!(matches!(result, Err(AuthError::InvalidResponse)));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_rejects_unknown_message_type() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            server_handshake(&mut server, &authenticator, DEADLINE).await
        });

        client.write_all(&[7, 0, 0, 0, 2, b'h', b'i']).await.unwrap();
        assert!(matches!(
            server_task.await.unwrap(),
            Err(AuthError::InvalidResponse)
        ));
    }

    #[tokio::test]
    async fn test_client_rejects_unknown_message_type() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            let _ = protocol::decode(&mut server).await.unwrap();
            server.write_all(&[9, 0, 0, 0, 2, b'o', b'k']).await.unwrap();
            server
        });

        let result = client_handshake(&mut client, "secret", DEADLINE).await;
        assert!(matches!(result, Err(AuthError::InvalidResponse)));
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_handshake_deadline() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        // Keep the peer alive but silent
        let (_client, mut server) = duplex(1024);

        let result =
            server_handshake(&mut server, &authenticator, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AuthError::Timeout)));
    }

    #[tokio::test]
    async fn test_handshake_peer_closed() {
        let (mut client, server) = duplex(1024);
        drop(server);

        let result = client_handshake(&mut client, "secret", DEADLINE).await;
        assert!(matches!(
            result,
            Err(AuthError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_auth_frame() {
        let authenticator = Authenticator::new(hash_password("secret").unwrap());
        let (mut client, mut server) = duplex(1024);

        let encoded = protocol::encode(&Message::auth("secret")).unwrap();
        client
            .write_all(&encoded[..encoded.len() - 2])
            .await
            .unwrap();
        drop(client);

        let result = server_handshake(&mut server, &authenticator, DEADLINE).await;
        assert!(matches!(
            result,
            Err(AuthError::Protocol(ProtocolError::IncompleteFrame))
        ));
    }

    #[test]
    fn test_generate_token_deterministic() {
        let source = |buf: &mut [u8]| -> io::Result<()> {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = 0xa0 + i as u8;
            }
            Ok(())
        };

        let first = generate_token(4, Some(&source)).unwrap();
        let second = generate_token(4, Some(&source)).unwrap();
        assert_eq!(first, "a0a1a2a3");
        assert_eq!(first, second);
    }

    #[test]
    fn test_generate_token_random() {
        let token = generate_token(16, None).unwrap();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token(16, None).unwrap());
    }

    #[test]
    fn test_generate_token_errors() {
        assert!(matches!(
            generate_token(0, None),
            Err(AuthError::TokenGeneration(_))
        ));

        let failing = |_: &mut [u8]| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "entropy pool empty"))
        };
        assert!(matches!(
            generate_token(8, Some(&failing)),
            Err(AuthError::TokenGeneration(msg)) if msg.contains("entropy")
        ));
    }
}
