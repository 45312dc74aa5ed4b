//! JWT token generation and validation

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use tabula_common::error::{Error, Result};

/// Claims carried by issued tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Role used by the RBAC guard
    pub role: String,
    /// Issuer
    pub iss: String,
    /// Issued at (as UTC timestamp)
    pub iat: i64,
    /// Expiration time (as UTC timestamp)
    pub exp: i64,
}

/// JWT manager for token generation and validation
pub struct JwtManager {
    secret: Vec<u8>,
    issuer: String,
    ttl_seconds: i64,
    algorithm: Algorithm,
}

impl JwtManager {
    /// Create a new JWT manager with the given configuration
    #[must_use]
    pub fn new(secret: &str, issuer: &str, ttl_seconds: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            issuer: issuer.to_string(),
            ttl_seconds: i64::try_from(ttl_seconds).unwrap_or(i64::MAX),
            algorithm: Algorithm::HS256,
        }
    }

    /// Generate a new JWT secret if none provided
    #[must_use]
    pub fn generate_secret() -> String {
        use base64::Engine;
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        base64::engine::general_purpose::STANDARD.encode(&bytes)
    }

    /// Issue a token for `sub` with the configured lifetime
    ///
    /// # Errors
    /// Returns `Error::Internal` if encoding fails.
    pub fn create_token(&self, sub: &str, role: &str) -> Result<String> {
        self.create_token_with_ttl(sub, role, self.ttl_seconds)
    }

    /// Issue a token with an explicit lifetime in seconds
    ///
    /// # Errors
    /// Returns `Error::Internal` if encoding fails.
    pub fn create_token_with_ttl(&self, sub: &str, role: &str, ttl_seconds: i64) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(ttl_seconds);

        let claims = Claims {
            sub: sub.to_string(),
            role: role.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };

        encode(
            &Header::new(self.algorithm),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| Error::Internal(format!("Failed to encode JWT: {e}")))
    }

    /// Validate and decode a token
    ///
    /// # Errors
    /// Returns `Error::TokenExpired` for expired tokens and `Error::InvalidToken`
    /// for any other validation failure.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.leeway = 0;

        decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Error::TokenExpired,
                _ => Error::InvalidToken,
            })
    }

    /// Token lifetime in seconds
    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        u64::try_from(self.ttl_seconds).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate_token() {
        let manager = JwtManager::new("test-secret-key", "tabula", 3600);
        let token = manager.create_token("42", "editor").unwrap();
        let claims = manager.validate(&token).unwrap();

        assert_eq!(claims.sub, "42");
        assert_eq!(claims.role, "editor");
        assert_eq!(claims.iss, "tabula");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_invalid_token() {
        let manager = JwtManager::new("test-secret-key", "tabula", 3600);
        assert!(matches!(
            manager.validate("invalid.token.here"),
            Err(Error::InvalidToken)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtManager::new("secret-a", "tabula", 3600);
        let verifier = JwtManager::new("secret-b", "tabula", 3600);
        let token = issuer.create_token("1", "admin").unwrap();
        assert!(verifier.validate(&token).is_err());
    }

    #[test]
    fn test_expired_token() {
        let manager = JwtManager::new("test-secret-key", "tabula", 3600);
        let token = manager.create_token_with_ttl("1", "admin", -120).unwrap();
        assert!(matches!(manager.validate(&token), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_generate_secret() {
        let a = JwtManager::generate_secret();
        let b = JwtManager::generate_secret();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
