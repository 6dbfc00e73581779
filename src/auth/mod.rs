//! Password authentication for tunnel sessions
//!
//! This module provides:
//! - bcrypt-backed password verification
//! - The two-message auth handshake run before any data is proxied
//! - Random session token generation

mod handshake;

pub use handshake::{client_handshake, generate_token, server_handshake, RandomSource};

use crate::protocol::ProtocolError;
use std::fmt;
use thiserror::Error;

/// bcrypt work factor used by [`hash_password`]
pub const HASH_COST: u32 = 10;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("invalid auth response")]
    InvalidResponse,

    #[error("failed generating session token: {0}")]
    TokenGeneration(String),

    #[error("handshake deadline exceeded")]
    Timeout,

    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verifies plaintext passwords against a stored bcrypt hash
#[derive(Clone, Default)]
pub struct Authenticator {
    password_hash: Option<String>,
}

impl Authenticator {
    /// Create an authenticator from a stored hash. An empty hash rejects everything.
    pub fn new(password_hash: impl Into<String>) -> Self {
        let password_hash = password_hash.into();
        Self {
            password_hash: (!password_hash.is_empty()).then_some(password_hash),
        }
    }

    /// Check whether a hash is configured
    pub fn is_configured(&self) -> bool {
        self.password_hash.is_some()
    }

    /// Returns true iff `password` matches the stored hash
    pub fn authenticate(&self, password: impl AsRef<[u8]>) -> bool {
        match &self.password_hash {
            Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            None => false,
        }
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// Produce a new salted bcrypt hash for `password`
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(bcrypt::hash(password, HASH_COST)?)
}
