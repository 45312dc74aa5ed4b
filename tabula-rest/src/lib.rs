//! Tabula REST Pipeline
//!
//! Exposes SQLite tables through an action-oriented CRUD API:
//! - Filter/sort DSL compiled into parameterized SQL
//! - Query executor with pagination and transactional bulk inserts
//! - Sliding-window rate limiting with file or memory storage
//! - Role-based access control per table and action
//! - Read caching with per-table invalidation
//! - Before/after hooks and custom actions
//! - actix-web HTTP binding

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod credentials;
pub mod db;
pub mod executor;
pub mod hooks;
pub mod pipeline;
pub mod query;
pub mod ratelimit;
pub mod rbac;
pub mod schema;
pub mod server;

pub use cache::{CacheManager, CacheStats, CacheStore, FileCacheStore, MemoryCacheStore};
pub use credentials::SqliteCredentialStore;
pub use db::Database;
pub use executor::QueryExecutor;
pub use hooks::{HookContext, HookRegistry};
pub use pipeline::{CleanupReport, Pipeline, CACHE_HEADER};
pub use query::{compile_filter, compile_sort, CompiledFilter, FilterOperator, QueryOptions};
pub use ratelimit::{FileRateLimitStore, MemoryRateLimitStore, RateLimitResult, RateLimitStore, RateLimiter};
pub use rbac::RbacGuard;
pub use schema::{SchemaCache, SchemaInspector, SqliteSchemaInspector};
pub use server::RestServer;
