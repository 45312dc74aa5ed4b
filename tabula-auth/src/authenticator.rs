//! Request authentication

use base64::Engine;
use std::collections::HashMap;
use tracing::{debug, warn};

use tabula_common::config::{AuthConfig, AuthMethod};
use tabula_common::error::Result;
use tabula_common::request::ApiRequest;

use crate::credentials::CredentialVerifier;
use crate::jwt::JwtManager;

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id (token subject or basic-auth user); API keys carry none
    pub user_id: Option<String>,
    /// Role used by the RBAC guard
    pub role: Option<String>,
    /// Method that produced this identity
    pub method: AuthMethod,
    /// API key presented, if the key method matched
    pub api_key: Option<String>,
}

/// A freshly issued access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

/// Authentication collaborator consulted by the pipeline
pub trait Authenticator: Send + Sync {
    /// Resolve the caller of `request`, `None` when no method accepts it
    fn authenticate(&self, request: &ApiRequest) -> Option<Identity>;

    /// Issue a signed token for a verified user
    ///
    /// # Errors
    /// Returns an error if the token cannot be signed.
    fn create_jwt(&self, user_id: &str, role: &str) -> Result<IssuedToken>;
}

/// Authenticator driven entirely by `AuthConfig`
pub struct ConfigAuthenticator {
    methods: Vec<AuthMethod>,
    jwt: JwtManager,
    api_keys: HashMap<String, String>,
    basic: CredentialVerifier,
}

impl ConfigAuthenticator {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let secret = if config.jwt_secret.trim().is_empty() {
            warn!("auth.jwt_secret not set, tokens will not survive a restart");
            JwtManager::generate_secret()
        } else {
            config.jwt_secret.clone()
        };

        Self {
            methods: config.methods.clone(),
            jwt: JwtManager::new(&secret, &config.jwt_issuer, config.jwt_ttl),
            api_keys: config.api_keys.clone(),
            basic: CredentialVerifier::new(None, config.users.clone()),
        }
    }

    /// The token manager backing the `jwt` method
    #[must_use]
    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    fn bearer_identity(&self, request: &ApiRequest) -> Option<Identity> {
        let token = strip_scheme(request.header("authorization")?, "Bearer")?;
        match self.jwt.validate(token) {
            Ok(claims) => Some(Identity {
                user_id: Some(claims.sub),
                role: Some(claims.role),
                method: AuthMethod::Jwt,
                api_key: None,
            }),
            Err(e) => {
                debug!("bearer token rejected: {}", e);
                None
            }
        }
    }

    fn api_key_identity(&self, request: &ApiRequest) -> Option<Identity> {
        let key = request
            .header("x-api-key")
            .or_else(|| request.param("api_key"))?;
        let role = self.api_keys.get(key)?;
        Some(Identity {
            user_id: None,
            role: Some(role.clone()),
            method: AuthMethod::ApiKey,
            api_key: Some(key.to_string()),
        })
    }

    fn basic_identity(&self, request: &ApiRequest) -> Option<Identity> {
        let encoded = strip_scheme(request.header("authorization")?, "Basic")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        let user = self.basic.verify_config_user(username, password)?;
        Some(Identity {
            user_id: Some(username.to_string()),
            role: Some(user.role.clone()),
            method: AuthMethod::Basic,
            api_key: None,
        })
    }
}

impl Authenticator for ConfigAuthenticator {
    fn authenticate(&self, request: &ApiRequest) -> Option<Identity> {
        self.methods.iter().find_map(|method| match method {
            AuthMethod::Jwt => self.bearer_identity(request),
            AuthMethod::ApiKey => self.api_key_identity(request),
            AuthMethod::Basic => self.basic_identity(request),
        })
    }

    fn create_jwt(&self, user_id: &str, role: &str) -> Result<IssuedToken> {
        Ok(IssuedToken {
            token: self.jwt.create_token(user_id, role)?,
            expires_in: self.jwt.ttl_seconds(),
        })
    }
}

/// Strip an auth scheme prefix (case-insensitive) from a header value
fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (given, rest) = header.trim().split_once(' ')?;
    if given.eq_ignore_ascii_case(scheme) {
        Some(rest.trim()).filter(|s| !s.is_empty())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_common::config::UserConfig;
    use tabula_common::request::Method;

    fn config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            methods: vec![AuthMethod::Jwt, AuthMethod::ApiKey, AuthMethod::Basic],
            jwt_secret: "unit-test-secret".to_string(),
            api_keys: HashMap::from([("key-123".to_string(), "reader".to_string())]),
            users: HashMap::from([(
                "admin".to_string(),
                UserConfig {
                    password: "letmein".to_string(),
                    role: "admin".to_string(),
                },
            )]),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_api_key_header_and_param() {
        let auth = ConfigAuthenticator::new(&config());

        let req = ApiRequest::new(Method::Get).with_header("X-API-Key", "key-123");
        let identity = auth.authenticate(&req).unwrap();
        assert_eq!(identity.method, AuthMethod::ApiKey);
        assert_eq!(identity.role.as_deref(), Some("reader"));
        assert_eq!(identity.user_id, None);

        let req = ApiRequest::new(Method::Get).with_query("api_key", "key-123");
        assert!(auth.authenticate(&req).is_some());

        let req = ApiRequest::new(Method::Get).with_header("X-API-Key", "unknown");
        assert!(auth.authenticate(&req).is_none());
    }

    #[test]
    fn test_bearer_token_roundtrip() {
        let auth = ConfigAuthenticator::new(&config());
        let issued = auth.create_jwt("7", "editor").unwrap();
        assert_eq!(issued.expires_in, 3600);

        let req = ApiRequest::new(Method::Get)
            .with_header("Authorization", format!("Bearer {}", issued.token));
        let identity = auth.authenticate(&req).unwrap();
        assert_eq!(identity.user_id.as_deref(), Some("7"));
        assert_eq!(identity.role.as_deref(), Some("editor"));
        assert_eq!(identity.method, AuthMethod::Jwt);
    }

    #[test]
    fn test_basic_auth() {
        let auth = ConfigAuthenticator::new(&config());
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:letmein");
        let req = ApiRequest::new(Method::Get).with_header("Authorization", format!("Basic {encoded}"));
        let identity = auth.authenticate(&req).unwrap();
        assert_eq!(identity.user_id.as_deref(), Some("admin"));

        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:wrong");
        let req = ApiRequest::new(Method::Get).with_header("Authorization", format!("Basic {encoded}"));
        assert!(auth.authenticate(&req).is_none());
    }

    #[test]
    fn test_disabled_method_ignored() {
        let mut cfg = config();
        cfg.methods = vec![AuthMethod::Jwt];
        let auth = ConfigAuthenticator::new(&cfg);
        let req = ApiRequest::new(Method::Get).with_header("X-API-Key", "key-123");
        assert!(auth.authenticate(&req).is_none());
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("bearer abc", "Bearer"), Some("abc"));
        assert_eq!(strip_scheme("Basic abc", "Bearer"), None);
        assert_eq!(strip_scheme("Bearer ", "Bearer"), None);
    }
}
