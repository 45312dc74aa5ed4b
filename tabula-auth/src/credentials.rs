//! Login credential verification

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use tabula_common::config::UserConfig;
use tabula_common::error::{Error, Result};

use crate::sha256_hex;

/// Credential row as stored in the credentials table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub active: bool,
}

/// Source of stored credentials (the database in production)
pub trait CredentialStore: Send + Sync {
    /// Look up a user by name
    ///
    /// # Errors
    /// Returns an error if the backing store cannot be queried.
    fn find(&self, username: &str) -> Result<Option<StoredCredential>>;
}

/// Where a successful login was verified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Database,
    Config,
}

/// A successfully verified login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub username: String,
    pub role: String,
    pub source: CredentialSource,
}

/// Checks username/password pairs against the store, then the config users
pub struct CredentialVerifier {
    store: Option<Arc<dyn CredentialStore>>,
    users: HashMap<String, UserConfig>,
}

impl CredentialVerifier {
    #[must_use]
    pub fn new(store: Option<Arc<dyn CredentialStore>>, users: HashMap<String, UserConfig>) -> Self {
        Self { store, users }
    }

    /// Verify a login attempt
    ///
    /// A user found in the store is decided by the store alone; the config
    /// users are consulted only when the store has no such user or cannot be
    /// queried.
    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> Option<VerifiedUser> {
        if let Some(store) = &self.store {
            match store.find(username) {
                Ok(Some(stored)) => {
                    if stored.active && verify_password(password, &stored.password_hash) {
                        return Some(VerifiedUser {
                            username: stored.username,
                            role: stored.role,
                            source: CredentialSource::Database,
                        });
                    }
                    debug!(username, "stored credential rejected");
                    return None;
                }
                Ok(None) => {}
                Err(e) => warn!("credential store unavailable, using config users: {}", e),
            }
        }

        let user = self.users.get(username)?;
        if verify_config_password(password, &user.password) {
            Some(VerifiedUser {
                username: username.to_string(),
                role: user.role.clone(),
                source: CredentialSource::Config,
            })
        } else {
            None
        }
    }

    /// Check basic-auth style credentials against config users only
    #[must_use]
    pub fn verify_config_user(&self, username: &str, password: &str) -> Option<&UserConfig> {
        self.users
            .get(username)
            .filter(|user| verify_config_password(password, &user.password))
    }
}

/// Hash a password into an argon2 PHC string
///
/// # Errors
/// Returns `Error::Internal` if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("Password hashing failed: {e}")))
}

/// Verify a password against an argon2 PHC string
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Config passwords may be argon2 hashes or plain text
fn verify_config_password(password: &str, configured: &str) -> bool {
    if configured.starts_with("$argon2") {
        verify_password(password, configured)
    } else {
        sha256_hex(password) == sha256_hex(configured)
    }
}
