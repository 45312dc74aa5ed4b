//! Tabula: database tables as a CRUD API
//!
//! Wires the request pipeline (rate limiting, authentication, RBAC, caching,
//! query execution and audit logging) to an actix-web server over a SQLite
//! database.
//!
//! # Features
//!
//! - **Filter/sort DSL** - `col:op:value` filters compiled to bound SQL
//! - **Authentication** - JWT, API keys and basic auth, with a `login` action
//! - **RBAC** - per-role table permissions with wildcard entries
//! - **Rate limiting** - sliding window per user, API key or client address
//! - **Caching** - read results cached per table, invalidated on writes
//! - **Audit log and monitor** - redacted request log, metrics and alerts

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use tabula_auth as auth;
pub use tabula_common as common;
pub use tabula_observability as observability;
pub use tabula_rest as rest;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tabula_common::config::TabulaConfig;
use tabula_common::error::Result;
use tabula_observability::{AlertHandler, TracingAlertHandler};
use tabula_rest::{CleanupReport, Database, Pipeline, RestServer};

/// Main tabula server
pub struct TabulaServer {
    config: TabulaConfig,
    pipeline: Arc<Pipeline>,
    rest_server: RestServer,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl TabulaServer {
    /// Validate the configuration and open the configured database
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the database or
    /// storage directories cannot be opened.
    pub fn new(config: TabulaConfig) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::open(&config.database)?);
        Self::with_database(config, db)
    }

    /// Build the server over an already open database
    ///
    /// # Errors
    /// Returns an error if a storage directory cannot be created.
    pub fn with_database(config: TabulaConfig, db: Arc<Database>) -> Result<Self> {
        info!("Initializing tabula pipeline");

        let pipeline = Arc::new(Pipeline::from_config(&config, db)?);
        pipeline
            .monitor()
            .register_handler(Arc::new(TracingAlertHandler));

        let rest_server = RestServer::new(config.server.clone(), Arc::clone(&pipeline));

        Ok(Self {
            config,
            pipeline,
            rest_server,
            cleanup_task: Mutex::new(None),
        })
    }

    /// Add a handler that receives every monitor alert
    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.pipeline.monitor().register_handler(handler);
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn config(&self) -> &TabulaConfig {
        &self.config
    }

    /// Run one maintenance sweep immediately
    #[must_use]
    pub fn cleanup(&self) -> CleanupReport {
        self.pipeline.cleanup()
    }

    /// Serve the API and run periodic maintenance until stopped
    ///
    /// # Errors
    /// Returns an error if the HTTP server fails to start.
    pub async fn run(&self) -> Result<()> {
        info!(
            "  - API: http://{}:{}/api",
            self.config.server.host, self.config.server.port
        );
        info!(
            "  - Health: http://{}:{}/health",
            self.config.server.host, self.config.server.port
        );

        self.spawn_cleanup();
        self.rest_server.run().await
    }

    /// Stop background maintenance
    ///
    /// # Errors
    /// Returns an error if shutdown fails.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down tabula");
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn spawn_cleanup(&self) {
        let interval = self.config.server.cleanup_interval_seconds;
        if interval == 0 {
            return;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pipeline = Arc::clone(&pipeline);
                if let Err(e) = tokio::task::spawn_blocking(move || pipeline.cleanup()).await {
                    warn!("maintenance sweep panicked: {}", e);
                }
            }
        });
        *self.cleanup_task.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use tabula_common::request::{ApiRequest, Method};

    fn config(dir: &std::path::Path) -> TabulaConfig {
        let mut config = TabulaConfig::default();
        config.database.path = ":memory:".to_string();
        config.rate_limit.storage_dir = Some(dir.join("rate_limits"));
        config.logging.dir = dir.join("logs");
        config.monitor.dir = dir.join("metrics");
        config
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.api.max_page_size = 0;
        assert!(TabulaServer::new(config).is_err());
    }

    #[test]
    fn test_alert_handlers_receive_errors() {
        let dir = tempfile::tempdir().unwrap();
        let server = TabulaServer::new(config(dir.path())).unwrap();

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.register_alert_handler(Arc::new(move |alert: &tabula_observability::Alert| -> Result<()> {
            sink.lock().push(alert.message.clone());
            Ok(())
        }));
        server
            .pipeline()
            .hooks()
            .register_action("explode", |_| {
                Err(tabula_common::Error::Internal("disk on fire".to_string()))
            })
            .unwrap();

        let resp = server
            .pipeline()
            .handle(&ApiRequest::new(Method::Get).with_query("action", "explode"));
        assert_eq!(resp.status, 500);
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_cleanup_task() {
        let dir = tempfile::tempdir().unwrap();
        let server = TabulaServer::new(config(dir.path())).unwrap();
        server.spawn_cleanup();
        assert!(server.cleanup_task.lock().is_some());
        server.shutdown().await.unwrap();
        assert!(server.cleanup_task.lock().is_none());
    }
}
