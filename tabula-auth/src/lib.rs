//! Tabula Authentication
//!
//! Implements the authenticator collaborator consulted by the request
//! pipeline:
//! - HS256 JWT issuance and validation
//! - API key lookup (`X-API-Key` header or `api_key` parameter)
//! - HTTP basic auth against configured users
//! - Login credential verification (database-backed with config fallback)

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod authenticator;
pub mod credentials;
pub mod jwt;

pub use authenticator::{Authenticator, ConfigAuthenticator, Identity, IssuedToken};
pub use credentials::{
    hash_password, verify_password, CredentialSource, CredentialStore, CredentialVerifier,
    StoredCredential, VerifiedUser,
};
pub use jwt::{Claims, JwtManager};

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest, used wherever a secret must become a stable key
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
