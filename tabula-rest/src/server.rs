//! actix-web binding for the request pipeline

use actix_web::http::StatusCode;
use actix_web::{middleware, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use tabula_common::config::ServerConfig;
use tabula_common::error::{Error, Result};
use tabula_common::request::{ApiRequest, ApiResponse, Method};

use crate::pipeline::Pipeline;

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub struct RestServer {
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
}

impl RestServer {
    #[must_use]
    pub fn new(config: ServerConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { config, pipeline }
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Serve until the server is stopped
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let pipeline = Arc::clone(&self.pipeline);
        let host = self.config.host.clone();
        let port = self.config.port;

        info!("Starting tabula API on {}:{}", host, port);

        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(Arc::clone(&pipeline)))
                .app_data(web::PayloadConfig::new(MAX_BODY_BYTES))
                .wrap(middleware::Logger::default())
                .configure(configure)
        })
        .workers(self.config.workers.max(1))
        .bind((host.as_str(), port))?
        .run()
        .await?;

        Ok(())
    }
}

/// Register the `/health` and `/api` routes (`/` is an alias of `/api`)
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_handler))
        .route("/api", web::route().to(api_handler))
        .route("/", web::route().to(api_handler));
}

async fn health_handler(pipeline: web::Data<Arc<Pipeline>>) -> HttpResponse {
    let (healthy, report) = pipeline.health();
    if healthy {
        HttpResponse::Ok().json(report)
    } else {
        HttpResponse::ServiceUnavailable().json(report)
    }
}

async fn api_handler(
    pipeline: web::Data<Arc<Pipeline>>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    let request = match build_request(&req, &body) {
        Ok(request) => request,
        Err(e) => {
            warn!(path = %req.path(), "rejected request: {}", e);
            return into_http(ApiResponse::error(e.status_code(), e.to_string()));
        }
    };

    let pipeline = Arc::clone(pipeline.get_ref());
    match web::block(move || pipeline.handle(&request)).await {
        Ok(response) => into_http(response),
        Err(e) => {
            error!("pipeline task failed: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": "Internal server error" }))
        }
    }
}

/// Convert the actix request into the pipeline's request value
///
/// # Errors
/// Returns `Error::Validation` when a non-empty body is not valid JSON.
pub fn build_request(req: &HttpRequest, body: &[u8]) -> Result<ApiRequest> {
    let mut request = ApiRequest::new(Method::parse(req.method().as_str()));

    for (key, value) in url::form_urlencoded::parse(req.query_string().as_bytes()) {
        request = request.with_query(key, value);
    }
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            request = request.with_header(name.as_str(), value);
        }
    }
    if let Some(peer) = req.peer_addr() {
        request = request.with_remote_addr(peer.ip().to_string());
    }

    if !body.iter().all(u8::is_ascii_whitespace) {
        let json = serde_json::from_slice(body)
            .map_err(|e| Error::Validation(format!("Invalid JSON body: {e}")))?;
        request = request.with_body(json);
    }
    Ok(request)
}

fn into_http(response: ApiResponse) -> HttpResponse {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &response.headers {
        builder.append_header((name.as_str(), value.as_str()));
    }

    if status == StatusCode::NO_CONTENT || response.body.is_null() {
        builder.finish()
    } else {
        builder.json(&response.body)
    }
}
