//! Configuration types for tabula

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::Action;

/// Main configuration for every tabula component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabulaConfig {
    /// HTTP binding configuration
    pub server: ServerConfig,
    /// Database connection configuration
    pub database: DatabaseConfig,
    /// API behaviour configuration
    pub api: ApiConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Role based access control
    pub rbac: RbacConfig,
    /// Rate limiter configuration
    pub rate_limit: RateLimitConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Request audit log configuration
    pub logging: LoggingConfig,
    /// Metrics and alerting configuration
    pub monitor: MonitorConfig,
    /// CORS configuration
    pub cors: CorsConfig,
}

impl TabulaConfig {
    /// Validate cross-field constraints once at startup
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.enabled {
            if self.rate_limit.max_requests == 0 {
                return Err(Error::Config(
                    "rate_limit.max_requests must be greater than 0".to_string(),
                ));
            }
            if self.rate_limit.window_seconds == 0 {
                return Err(Error::Config(
                    "rate_limit.window_seconds must be greater than 0".to_string(),
                ));
            }
        }

        if !(1..=100).contains(&self.api.max_page_size) {
            return Err(Error::Config(
                "api.max_page_size must be within 1..=100".to_string(),
            ));
        }
        if self.api.default_page_size == 0 || self.api.default_page_size > self.api.max_page_size {
            return Err(Error::Config(
                "api.default_page_size must be within 1..=api.max_page_size".to_string(),
            ));
        }

        if self.auth.enabled {
            if self.auth.methods.is_empty() {
                return Err(Error::Config(
                    "auth.methods must list at least one method when auth is enabled".to_string(),
                ));
            }
            if self.auth.methods.contains(&AuthMethod::Jwt) && self.auth.jwt_secret.trim().is_empty()
            {
                return Err(Error::Config(
                    "auth.jwt_secret is required when the jwt method is enabled".to_string(),
                ));
            }
        }

        if self.cache.enabled && self.cache.default_ttl == 0 {
            return Err(Error::Config("cache.default_ttl must be greater than 0".to_string()));
        }

        Ok(())
    }
}

/// HTTP binding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on (default: 8080)
    pub port: u16,
    /// Number of HTTP worker threads
    pub workers: usize,
    /// Interval between maintenance sweeps in seconds
    pub cleanup_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            cleanup_interval_seconds: 3600,
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (":memory:" for an in-memory database)
    pub path: String,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "tabula.db".to_string(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// API behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Expose internal error messages in 500 responses
    pub expose_error_details: bool,
    /// Page size used when the request does not provide one
    pub default_page_size: u32,
    /// Upper bound for requested page sizes
    pub max_page_size: u32,
    /// Table holding login credentials (never exposed through the API)
    pub credentials_table: String,
    /// Additional tables hidden from the API
    pub hidden_tables: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            expose_error_details: true,
            default_page_size: 20,
            max_page_size: 100,
            credentials_table: "api_users".to_string(),
            hidden_tables: vec![],
        }
    }
}

/// Accepted authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Jwt,
    Basic,
}

impl AuthMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Jwt => "jwt",
            Self::Basic => "basic",
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require authentication for every non-login action
    pub enabled: bool,
    /// Methods tried in order when authenticating a request
    pub methods: Vec<AuthMethod>,
    /// HS256 secret for issued tokens
    pub jwt_secret: String,
    /// Issuer claim for issued tokens
    pub jwt_issuer: String,
    /// Token lifetime in seconds (default: 3600)
    pub jwt_ttl: u64,
    /// API key to role mapping
    pub api_keys: HashMap<String, String>,
    /// Static users used for basic auth and as login fallback
    pub users: HashMap<String, UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            methods: vec![AuthMethod::Jwt, AuthMethod::ApiKey],
            jwt_secret: String::new(),
            jwt_issuer: "tabula".to_string(),
            jwt_ttl: 3600,
            api_keys: HashMap::new(),
            users: HashMap::new(),
        }
    }
}

/// Static user entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Plain text password or an argon2 PHC string
    pub password: String,
    /// Role granted on successful authentication
    pub role: String,
}

/// Role based access control configuration
///
/// Maps role name to table name (or `"*"`) to the permitted actions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    pub roles: HashMap<String, HashMap<String, Vec<Action>>>,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether to enforce limits at all
    pub enabled: bool,
    /// Maximum requests per window
    pub max_requests: u32,
    /// Sliding window length in seconds
    pub window_seconds: u64,
    /// Directory for per-identifier state (in-memory when unset)
    pub storage_dir: Option<PathBuf>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window_seconds: 60,
            storage_dir: Some(PathBuf::from("storage/rate_limits")),
        }
    }
}

/// Cache storage drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDriver {
    Memory,
    File,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether read results are cached
    pub enabled: bool,
    /// Storage driver
    pub driver: CacheDriver,
    /// Directory used by the file driver
    pub dir: PathBuf,
    /// Default time-to-live in seconds
    pub default_ttl: u64,
    /// Per-table time-to-live overrides
    pub table_ttl: HashMap<String, u64>,
    /// Tables that are never cached
    pub exclude_tables: Vec<String>,
    /// Separate cached results per API key
    pub vary_by_api_key: bool,
    /// Separate cached results per authenticated user
    pub vary_by_user: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            driver: CacheDriver::Memory,
            dir: PathBuf::from("storage/cache"),
            default_ttl: 300,
            table_ttl: HashMap::new(),
            exclude_tables: vec![],
            vary_by_api_key: false,
            vary_by_user: false,
        }
    }
}

/// Request audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Whether audit events are written
    pub enabled: bool,
    /// Directory for the per-day log files
    pub dir: PathBuf,
    /// Include request bodies in request events
    pub log_bodies: bool,
    /// Include request headers in request events
    pub log_headers: bool,
    /// Keys whose values are redacted (case-insensitive substring match)
    pub sensitive_keys: Vec<String>,
    /// Size in bytes after which the active file is rotated
    pub max_file_size: u64,
    /// Days to keep log files
    pub retention_days: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("logs"),
            log_bodies: true,
            log_headers: false,
            sensitive_keys: [
                "password",
                "token",
                "secret",
                "api_key",
                "apikey",
                "authorization",
                "credit_card",
                "ssn",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            max_file_size: 10 * 1024 * 1024,
            retention_days: 30,
        }
    }
}

/// Metrics and alerting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether metrics and alerts are recorded
    pub enabled: bool,
    /// Directory for metric and alert files
    pub dir: PathBuf,
    /// Rolling metrics window in seconds
    pub window_seconds: u64,
    /// Error rate (percent) above which the service is unhealthy
    pub error_rate_threshold: f64,
    /// Average response time (ms) above which the service is slow
    pub response_time_threshold_ms: f64,
    /// Auth failures per window that raise a security alert
    pub auth_failure_threshold: u64,
    /// Rate-limit hits per window that raise an alert
    pub rate_limit_threshold: u64,
    /// Days to keep metric and alert files
    pub retention_days: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("storage/metrics"),
            window_seconds: 300,
            error_rate_threshold: 5.0,
            response_time_threshold_ms: 1000.0,
            auth_failure_threshold: 10,
            rate_limit_threshold: 50,
            retention_days: 7,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            allowed_headers: ["Content-Type", "Authorization", "X-API-Key"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            allow_credentials: false,
            max_age: 86_400,
        }
    }
}
