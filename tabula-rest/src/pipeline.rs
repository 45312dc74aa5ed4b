//! Request pipeline
//!
//! Every request goes through the same ordered stages, stopping at the first
//! terminal outcome:
//!
//! 1. CORS preflight
//! 2. Rate limiting
//! 3. `login` (bypasses the auth gate)
//! 4. Authentication
//! 5. Before hooks
//! 6. Action dispatch (RBAC, cache, executor)
//! 7. After hooks
//!
//! The outcome, successful or not, is then written to the request log.

use serde::Serialize;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use tabula_auth::{sha256_hex, Authenticator, ConfigAuthenticator, CredentialStore, CredentialVerifier, Identity};
use tabula_common::config::{ApiConfig, CorsConfig, TabulaConfig};
use tabula_common::error::{Error, Result};
use tabula_common::request::{ApiRequest, ApiResponse, Method};
use tabula_common::types::Action;
use tabula_observability::{HealthStatus, Monitor, RequestLogEntry, RequestLogger};

use crate::cache::CacheManager;
use crate::credentials::SqliteCredentialStore;
use crate::db::Database;
use crate::executor::QueryExecutor;
use crate::hooks::{panic_message, HookContext, HookRegistry};
use crate::query::QueryOptions;
use crate::ratelimit::{RateLimitResult, RateLimiter};
use crate::rbac::RbacGuard;
use crate::schema::{SchemaCache, SqliteSchemaInspector};

/// Response header reporting how a read was served
pub const CACHE_HEADER: &str = "X-Cache";

const OPENAPI_TITLE: &str = "Tabula API";

/// Rate limit records untouched for a day are swept
const RATE_LIMIT_RETENTION_SECS: u64 = 86_400;

/// Counts from one maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub rate_limits: usize,
    pub cache_entries: usize,
    pub log_files: usize,
    pub metric_files: usize,
}

#[derive(Default)]
struct Trace {
    identity: Option<Identity>,
    rate_limit: Option<(u32, u32)>,
}

pub struct Pipeline {
    api: ApiConfig,
    cors: CorsConfig,
    auth_enabled: bool,
    schema: Arc<SchemaCache>,
    executor: QueryExecutor,
    authenticator: Arc<dyn Authenticator>,
    credentials: CredentialVerifier,
    rate_limiter: Arc<RateLimiter>,
    rbac: RbacGuard,
    cache: Arc<CacheManager>,
    logger: Arc<RequestLogger>,
    monitor: Arc<Monitor>,
    hooks: Arc<HookRegistry>,
}

impl Pipeline {
    /// Wire every component from configuration over an open database
    ///
    /// # Errors
    /// Returns an error if a file-backed store cannot create its directory.
    pub fn from_config(config: &TabulaConfig, db: Arc<Database>) -> Result<Self> {
        let hidden = config
            .api
            .hidden_tables
            .iter()
            .cloned()
            .chain(std::iter::once(config.api.credentials_table.clone()));
        let inspector = Arc::new(SqliteSchemaInspector::new(Arc::clone(&db)));
        let schema = Arc::new(SchemaCache::new(inspector, hidden));

        let store: Arc<dyn CredentialStore> = Arc::new(SqliteCredentialStore::new(
            Arc::clone(&db),
            config.api.credentials_table.clone(),
        ));
        let monitor = Arc::new(Monitor::new(config.monitor.clone()));
        let logger = RequestLogger::new(config.logging.clone()).with_monitor(Arc::clone(&monitor));

        Ok(Self {
            api: config.api.clone(),
            cors: config.cors.clone(),
            auth_enabled: config.auth.enabled,
            executor: QueryExecutor::new(db, Arc::clone(&schema)),
            schema,
            authenticator: Arc::new(ConfigAuthenticator::new(&config.auth)),
            credentials: CredentialVerifier::new(Some(store), config.auth.users.clone()),
            rate_limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)?),
            rbac: RbacGuard::new(&config.rbac),
            cache: Arc::new(CacheManager::from_config(config.cache.clone())?),
            logger: Arc::new(logger),
            monitor,
            hooks: Arc::new(HookRegistry::new()),
        })
    }

    /// Replace the authenticator
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn logger(&self) -> &Arc<RequestLogger> {
        &self.logger
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    /// Health report plus cache counters, and whether the service is usable
    #[must_use]
    pub fn health(&self) -> (bool, Value) {
        let report = self.monitor.health();
        let healthy = report.status != HealthStatus::Critical;
        let mut body = serde_json::to_value(&report).unwrap_or_else(|_| json!({}));
        body["cache"] = serde_json::to_value(self.cache.stats()).unwrap_or(Value::Null);
        (healthy, body)
    }

    /// Sweep expired rate limit records, cache entries and old log files
    pub fn cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            rate_limits: self
                .rate_limiter
                .cleanup(RATE_LIMIT_RETENTION_SECS)
                .unwrap_or_else(|e| sweep_failed("rate limit", &e)),
            cache_entries: self
                .cache
                .cleanup()
                .unwrap_or_else(|e| sweep_failed("cache", &e)),
            log_files: self
                .logger
                .cleanup()
                .unwrap_or_else(|e| sweep_failed("log", &e)),
            metric_files: self
                .monitor
                .cleanup()
                .unwrap_or_else(|e| sweep_failed("metrics", &e)),
        };
        info!(?report, "maintenance sweep finished");
        report
    }

    /// Run one request through every stage and log the outcome
    pub fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let mut trace = Trace::default();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.process(request, &mut trace)));
        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => self.error_response(request, &request_id, &err),
            Err(payload) => {
                let err = Error::Internal(panic_message(payload.as_ref()));
                self.error_response(request, &request_id, &err)
            }
        };

        if let Some((limit, remaining)) = trace.rate_limit {
            response.headers.push(("X-RateLimit-Limit".to_string(), limit.to_string()));
            response
                .headers
                .push(("X-RateLimit-Remaining".to_string(), remaining.to_string()));
        }
        response.headers.extend(self.cors_headers(request));
        response
            .headers
            .push(("X-Request-Id".to_string(), request_id.clone()));

        let error = if response.is_success() {
            None
        } else {
            response
                .body
                .get("error")
                .and_then(Value::as_str)
                .map(String::from)
        };
        self.logger.log_request(&RequestLogEntry {
            request_id,
            method: request.method().to_string(),
            action: request.action().map(String::from),
            table: request.param("table").map(String::from),
            status: response.status,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            response_size: response.body_size(),
            client_ip: request.client_ip().map(String::from),
            user: trace.identity.and_then(|i| i.user_id),
            query: request.query().clone(),
            headers: request.headers().clone(),
            body: request.body().cloned(),
            error,
        });

        response
    }

    fn process(&self, request: &ApiRequest, trace: &mut Trace) -> Result<ApiResponse> {
        if request.method() == Method::Options {
            return Ok(ApiResponse::with_status(204, Value::Null));
        }

        let identity = self.authenticator.authenticate(request);
        trace.identity.clone_from(&identity);

        let identifier = rate_limit_identifier(request, identity.as_ref());
        let result = self.rate_limiter.check(&identifier);
        if let Some(err) = result.to_error() {
            self.logger.log_rate_limit(
                &identifier,
                self.rate_limiter.max_requests(),
                self.rate_limiter.window_seconds(),
            );
            return Err(err);
        }
        if let RateLimitResult::Allowed { remaining, limit } = result {
            if self.rate_limiter.is_enabled() {
                trace.rate_limit = Some((limit, remaining));
            }
        }

        let action = request
            .action()
            .ok_or_else(|| Error::Validation("Missing action parameter".to_string()))?;
        if action == "login" {
            return self.login(request);
        }

        if self.auth_enabled {
            let Some(identity) = identity.as_ref() else {
                let client_ip = request.client_ip();
                self.logger
                    .log_auth("request", false, client_ip, Some("No valid credentials"));
                self.logger.log_security(
                    "unauthenticated_request",
                    &json!({ "action": action, "client_ip": client_ip }),
                );
                return Err(Error::Unauthorized);
            };
            self.logger.log_auth(
                identity.method.as_str(),
                true,
                identity.user_id.as_deref().or(identity.role.as_deref()),
                None,
            );
        }

        let ctx = HookContext {
            action,
            request,
            identity: identity.as_ref(),
        };
        self.hooks.run_before(&ctx)?;
        let mut response = self.dispatch(&ctx)?;
        self.hooks.run_after(&ctx, &mut response)?;
        Ok(response)
    }

    fn dispatch(&self, ctx: &HookContext<'_>) -> Result<ApiResponse> {
        const READ: &[Method] = &[Method::Get, Method::Head];
        let request = ctx.request;

        match ctx.action {
            "tables" => {
                allow(ctx, READ)?;
                let role = ctx.identity.and_then(|i| i.role.as_deref());
                let tables: Vec<String> = self
                    .schema
                    .tables()?
                    .into_iter()
                    .filter(|t| {
                        !self.auth_enabled
                            || role.is_some_and(|r| self.rbac.is_allowed(r, t, Action::Read))
                    })
                    .collect();
                Ok(ApiResponse::ok(json!(tables)))
            }
            "columns" => {
                allow(ctx, READ)?;
                let table = self.table(ctx, Action::Read)?;
                Ok(ApiResponse::ok(json!(self.schema.column_descriptors(&table)?)))
            }
            "list" => {
                allow(ctx, READ)?;
                let table = self.table(ctx, Action::Read)?;
                let opts = self.query_options(request);
                self.cached(ctx, &table, || self.executor.list(&table, &opts))
            }
            "count" => {
                allow(ctx, READ)?;
                let table = self.table(ctx, Action::Read)?;
                let opts = self.query_options(request);
                self.cached(ctx, &table, || self.executor.count(&table, &opts))
            }
            "read" => {
                allow(ctx, READ)?;
                let table = self.table(ctx, Action::Read)?;
                let id = id_param(request)?;
                self.cached(ctx, &table, || {
                    self.executor
                        .read(&table, &id)?
                        .map(Value::Object)
                        .ok_or_else(|| Error::NotFound("Record not found".to_string()))
                })
            }
            "create" => {
                allow(ctx, &[Method::Post])?;
                let table = self.table(ctx, Action::Create)?;
                let row = self.write(&table, || self.executor.create(&table, body(request)?))?;
                Ok(ApiResponse::created(Value::Object(row)))
            }
            "update" => {
                allow(ctx, &[Method::Put, Method::Patch, Method::Post])?;
                let table = self.table(ctx, Action::Update)?;
                let id = id_param(request)?;
                let row = self.write(&table, || self.executor.update(&table, &id, body(request)?))?;
                Ok(ApiResponse::ok(Value::Object(row)))
            }
            "delete" => {
                allow(ctx, &[Method::Delete, Method::Post])?;
                let table = self.table(ctx, Action::Delete)?;
                let id = id_param(request)?;
                let result = self.write(&table, || self.executor.delete(&table, &id))?;
                Ok(ApiResponse::ok(result))
            }
            "bulk_create" => {
                allow(ctx, &[Method::Post])?;
                let table = self.table(ctx, Action::Create)?;
                let result = self.write(&table, || self.executor.bulk_create(&table, body(request)?))?;
                Ok(ApiResponse::created(result))
            }
            "bulk_delete" => {
                allow(ctx, &[Method::Delete, Method::Post])?;
                let table = self.table(ctx, Action::Delete)?;
                let result = self.write(&table, || self.executor.bulk_delete(&table, body(request)?))?;
                Ok(ApiResponse::ok(result))
            }
            "openapi" => {
                allow(ctx, READ)?;
                Ok(ApiResponse::ok(self.schema.generate_openapi(OPENAPI_TITLE)?))
            }
            custom => match self.hooks.action(custom) {
                Some(handler) => handler(ctx),
                None => Err(Error::InvalidAction(custom.to_string())),
            },
        }
    }

    /// Verify a username/password body and issue a bearer token
    fn login(&self, request: &ApiRequest) -> Result<ApiResponse> {
        if request.method() != Method::Post {
            return Err(Error::MethodNotAllowed {
                method: request.method().to_string(),
                action: "login".to_string(),
            });
        }

        let field = |name: &str| {
            request
                .body()
                .and_then(|b| b.get(name))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
        };
        let (Some(username), Some(password)) = (field("username"), field("password")) else {
            return Err(Error::Validation("Username and password are required".to_string()));
        };

        let Some(user) = self.credentials.verify(username, password) else {
            self.logger
                .log_auth("login", false, Some(username), Some("Invalid credentials"));
            self.logger.log_security(
                "login_failed",
                &json!({ "username": username, "client_ip": request.client_ip() }),
            );
            return Err(Error::InvalidCredentials);
        };

        let issued = self.authenticator.create_jwt(&user.username, &user.role)?;
        self.logger.log_auth("login", true, Some(username), None);
        Ok(ApiResponse::ok(json!({
            "token": issued.token,
            "token_type": "Bearer",
            "expires_in": issued.expires_in,
            "user": {
                "username": user.username,
                "role": user.role,
            }
        })))
    }

    /// Validated `table` parameter, after the RBAC check for `action`
    fn table(&self, ctx: &HookContext<'_>, action: Action) -> Result<String> {
        let name = ctx
            .request
            .param("table")
            .ok_or_else(|| Error::Validation("Missing table parameter".to_string()))?;
        let role = ctx.identity.and_then(|i| i.role.as_deref());
        self.rbac.guard(self.auth_enabled, role, name, action)?;
        Ok(self.schema.table(name)?.name.clone())
    }

    fn query_options(&self, request: &ApiRequest) -> QueryOptions {
        QueryOptions::from_params(
            request.query(),
            self.api.default_page_size,
            self.api.max_page_size,
        )
    }

    fn cached(
        &self,
        ctx: &HookContext<'_>,
        table: &str,
        load: impl FnOnce() -> Result<Value>,
    ) -> Result<ApiResponse> {
        if !self.cache.should_cache(table) {
            return Ok(ApiResponse::ok(load()?).header(CACHE_HEADER, "BYPASS"));
        }

        let key = self.cache.generate_key(
            table,
            ctx.request.query(),
            ctx.identity.and_then(|i| i.api_key.as_deref()),
            ctx.identity.and_then(|i| i.user_id.as_deref()),
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(ApiResponse::ok(hit).header(CACHE_HEADER, "HIT"));
        }

        let value = load()?;
        self.cache.set(&key, &value, table);
        Ok(ApiResponse::ok(value).header(CACHE_HEADER, "MISS"))
    }

    /// Run a write, then drop the table's cached reads whatever the outcome
    fn write<T>(&self, table: &str, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = op();
        self.cache.invalidate_table(table);
        result
    }

    fn error_response(&self, request: &ApiRequest, request_id: &str, err: &Error) -> ApiResponse {
        let status = err.status_code();

        if err.is_internal() {
            error!(request_id, code = err.error_code(), "request failed: {}", err);
            self.logger.log_error(
                &err.to_string(),
                &json!({
                    "request_id": request_id,
                    "method": request.method().as_str(),
                    "action": request.action(),
                    "table": request.param("table"),
                    "code": err.error_code(),
                }),
            );
            let message = if self.api.expose_error_details {
                err.to_string()
            } else {
                "Internal server error".to_string()
            };
            return ApiResponse::error(status, message);
        }

        match err {
            Error::RateLimitExceeded {
                limit,
                remaining,
                reset,
                window,
            } => ApiResponse::with_status(
                status,
                json!({
                    "error": err.to_string(),
                    "limit": limit,
                    "remaining": remaining,
                    "reset": reset,
                    "window": window,
                }),
            )
            .header("X-RateLimit-Limit", limit.to_string())
            .header("X-RateLimit-Remaining", remaining.to_string())
            .header("X-RateLimit-Reset", reset.to_string())
            .header("X-RateLimit-Window", window.to_string())
            .header("Retry-After", (*reset).max(1).to_string()),
            Error::Unauthorized | Error::InvalidToken | Error::TokenExpired => {
                ApiResponse::error(status, err.to_string()).header("WWW-Authenticate", "Bearer")
            }
            _ => ApiResponse::error(status, err.to_string()),
        }
    }

    fn cors_headers(&self, request: &ApiRequest) -> Vec<(String, String)> {
        let wildcard = self.cors.allowed_origins.iter().any(|o| o == "*");
        let allow_origin = match request.header("origin") {
            Some(origin) if self.cors.allowed_origins.iter().any(|o| o == origin) => origin.to_string(),
            Some(origin) if wildcard && self.cors.allow_credentials => origin.to_string(),
            _ if wildcard => "*".to_string(),
            _ => return vec![],
        };

        let mut headers = vec![
            (
                "Access-Control-Allow-Methods".to_string(),
                self.cors.allowed_methods.join(", "),
            ),
            (
                "Access-Control-Allow-Headers".to_string(),
                self.cors.allowed_headers.join(", "),
            ),
            (
                "Access-Control-Max-Age".to_string(),
                self.cors.max_age.to_string(),
            ),
        ];
        if self.cors.allow_credentials {
            headers.push(("Access-Control-Allow-Credentials".to_string(), "true".to_string()));
        }
        if allow_origin != "*" {
            headers.push(("Vary".to_string(), "Origin".to_string()));
        }
        headers.push(("Access-Control-Allow-Origin".to_string(), allow_origin));
        headers
    }
}

fn allow(ctx: &HookContext<'_>, methods: &[Method]) -> Result<()> {
    let method = ctx.request.method();
    if methods.contains(&method) {
        Ok(())
    } else {
        Err(Error::MethodNotAllowed {
            method: method.to_string(),
            action: ctx.action.to_string(),
        })
    }
}

/// The `id` parameter, bound as text
///
/// Integer primary keys still match through SQLite's numeric affinity, while
/// text keys such as `007` are compared verbatim.
fn id_param(request: &ApiRequest) -> Result<Value> {
    request
        .param("id")
        .map(|id| Value::String(id.to_string()))
        .ok_or_else(|| Error::Validation("Missing id parameter".to_string()))
}

fn body(request: &ApiRequest) -> Result<&Value> {
    request
        .body()
        .ok_or_else(|| Error::Validation("Request body is required".to_string()))
}

/// Rate limit key: user id, then validated API key digest, then client address
///
/// Unrecognised keys count against the client address.
fn rate_limit_identifier(request: &ApiRequest, identity: Option<&Identity>) -> String {
    if let Some(user) = identity.and_then(|i| i.user_id.as_deref()) {
        return format!("user:{user}");
    }
    if let Some(key) = identity.and_then(|i| i.api_key.as_deref()) {
        return format!("apikey:{}", sha256_hex(key));
    }
    format!("ip:{}", request.client_ip().unwrap_or("unknown"))
}

fn sweep_failed(what: &str, err: &dyn std::fmt::Display) -> usize {
    warn!("{} sweep failed: {}", what, err);
    0
}
