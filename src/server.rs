//! HTTP surface of the delivery service
//!
//! # Routes
//! - `GET|HEAD|OPTIONS /stream/{path}` - serve an object, honouring Range
//! - `GET /cache/content/stats`, `GET /cache/content/detailed`
//! - `POST /cache/content/clear`, `POST /cache/content/invalidate/{path}`
//! - `GET /cache/metadata/stats`, `POST /cache/metadata/clear`
//! - `GET /health`, `GET /health/full`
//! - `GET /metrics` - Prometheus text format

use crate::config::DeliveryConfig;
use crate::content_cache::ContentCache;
use crate::error::{DeliveryError, Result};
use crate::health_check::{HealthReport, HealthStatus};
use crate::metadata_cache::ObjectMetadataCache;
use crate::metrics::DeliveryMetrics;
use crate::store::{BackendConnector, GcsConnector, ReconnectListener, StoreClient};
use crate::stream_handler::{error_response, full_body, ResponseBody, StreamHandler};
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const STREAM_PREFIX: &str = "/stream/";
const INVALIDATE_PREFIX: &str = "/cache/content/invalidate/";

/// Fixed management routes, used to tell 405 from 404
const MANAGEMENT_ROUTES: &[&str] = &[
    "/cache/content/stats",
    "/cache/content/detailed",
    "/cache/content/clear",
    "/cache/metadata/stats",
    "/cache/metadata/clear",
    "/health",
    "/health/full",
    "/metrics",
];

/// Everything a request may touch, shared by all connections
pub struct AppState {
    pub config: Arc<DeliveryConfig>,
    pub store: Arc<StoreClient>,
    pub metadata_cache: Arc<ObjectMetadataCache>,
    pub content_cache: Arc<ContentCache>,
    pub metrics: Arc<DeliveryMetrics>,
    pub handler: StreamHandler,
}

impl AppState {
    /// Build the service against the object store named in `config`
    pub async fn from_config(config: DeliveryConfig) -> Result<Self> {
        let connector = Arc::new(GcsConnector::new(config.store.clone()));
        Self::with_connector(config, connector).await
    }

    /// Build the service against any store connector
    ///
    /// Opens (and rebuilds) the content cache directory. The metadata cache is
    /// registered with the store client so a reconnect clears it.
    pub async fn with_connector(
        config: DeliveryConfig,
        connector: Arc<dyn BackendConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(DeliveryMetrics::new().map_err(|e| {
            DeliveryError::InternalError(format!("Failed to register metrics: {}", e))
        })?);
        let metadata_cache = Arc::new(ObjectMetadataCache::from_config(&config.metadata_cache)?);
        let content_cache = Arc::new(ContentCache::open(&config.content_cache).await?);
        let store = Arc::new(
            StoreClient::new(connector, config.store.request_timeout())
                .with_listener(Arc::clone(&metadata_cache) as Arc<dyn ReconnectListener>)
                .with_metrics(Arc::clone(&metrics)),
        );

        let handler = StreamHandler::new(
            Arc::clone(&store),
            Arc::clone(&metadata_cache),
            Arc::clone(&content_cache),
            Arc::clone(&metrics),
            &config.streaming,
        );

        Ok(AppState {
            config: Arc::new(config),
            store,
            metadata_cache,
            content_cache,
            metrics,
            handler,
        })
    }
}

/// Dispatch one request to its route
///
/// The request body is never read; every route acts on method, path and
/// headers only.
pub async fn route<B>(state: &AppState, req: Request<B>) -> Response<ResponseBody> {
    let (parts, _) = req.into_parts();
    let path = parts.uri.path();

    if let Some(object) = path.strip_prefix(STREAM_PREFIX) {
        return match urlencoding::decode(object) {
            Ok(object) => state.handler.handle(&parts.method, &parts.headers, &object).await,
            Err(_) => not_found(),
        };
    }

    if let Some(object) = path.strip_prefix(INVALIDATE_PREFIX) {
        if parts.method != Method::POST {
            return method_not_allowed("POST");
        }
        return match urlencoding::decode(object) {
            Ok(object) if !object.is_empty() => invalidate_object(state, &object).await,
            _ => not_found(),
        };
    }

    match (&parts.method, path) {
        (&Method::GET, "/cache/content/stats") => {
            json_response(StatusCode::OK, &state.content_cache.stats())
        }
        (&Method::GET, "/cache/content/detailed") => {
            json_response(StatusCode::OK, &state.content_cache.detailed_stats())
        }
        (&Method::POST, "/cache/content/clear") => {
            let removed = state.content_cache.clear().await;
            state.metrics.record_invalidation("content_all", removed);
            info!("Content cache cleared: entries_removed={}", removed);
            json_response(StatusCode::OK, &serde_json::json!({ "cleared": removed }))
        }
        (&Method::GET, "/cache/metadata/stats") => {
            json_response(StatusCode::OK, &state.metadata_cache.stats())
        }
        (&Method::POST, "/cache/metadata/clear") => {
            let removed = state.metadata_cache.len();
            state.metadata_cache.clear();
            state.metrics.record_invalidation("metadata_all", removed);
            info!("Metadata cache cleared: entries_removed={}", removed);
            json_response(StatusCode::OK, &serde_json::json!({ "cleared": removed }))
        }
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": HealthStatus::Healthy.as_str() }),
        ),
        (&Method::GET, "/health/full") => {
            let report = HealthReport::collect(
                &state.store,
                &state.metadata_cache,
                &state.content_cache,
            )
            .await;
            json_response(report.status_code(), &report)
        }
        (&Method::GET, "/metrics") => metrics_response(&state.metrics),
        (_, known) if MANAGEMENT_ROUTES.contains(&known) => {
            let allowed = match known {
                "/cache/content/clear" | "/cache/metadata/clear" => "POST",
                _ => "GET",
            };
            method_not_allowed(allowed)
        }
        _ => not_found(),
    }
}

async fn invalidate_object(state: &AppState, object: &str) -> Response<ResponseBody> {
    let content_entries = state.content_cache.invalidate(object).await;
    let metadata_removed = state.metadata_cache.invalidate(object);
    state
        .metrics
        .record_invalidation("object", content_entries + usize::from(metadata_removed));

    info!(
        "Invalidated object: path={}, content_entries={}, metadata_removed={}",
        object, content_entries, metadata_removed
    );
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "path": object,
            "content_entries_removed": content_entries,
            "metadata_removed": metadata_removed,
        }),
    )
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full_body(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize response body: {}", e);
            error_response(&DeliveryError::from(e), true)
        }
    }
}

fn metrics_response(metrics: &DeliveryMetrics) -> Response<ResponseBody> {
    match metrics.encode() {
        Ok(text) => {
            let mut response = Response::new(full_body(text));
            if let Ok(value) = HeaderValue::from_str(&metrics.content_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            error_response(&DeliveryError::InternalError(e.to_string()), true)
        }
    }
}

fn not_found() -> Response<ResponseBody> {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "detail": "Not found" }))
}

fn method_not_allowed(allowed: &'static str) -> Response<ResponseBody> {
    let mut response = json_response(
        StatusCode::METHOD_NOT_ALLOWED,
        &serde_json::json!({ "detail": "Method not allowed" }),
    );
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allowed));
    response
}

/// HTTP/1.1 server running the delivery routes
pub struct DeliveryServer {
    state: Arc<AppState>,
}

impl DeliveryServer {
    pub fn new(state: AppState) -> Self {
        DeliveryServer {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Bind `addr` and serve until Ctrl-C
    pub async fn run(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Media delivery server listening on http://{}", addr);
        info!("  /stream/{{path}}   - Object streaming with Range support");
        info!("  /cache/content/*  - Content cache stats and control");
        info!("  /health/full      - Store and cache health");
        info!("  /metrics          - Prometheus metrics");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept connections on `listener` until `shutdown` resolves
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let header_read_timeout =
            Duration::from_secs(self.state.config.server.header_read_timeout_secs);
        tokio::pin!(shutdown);

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections");
                    return Ok(());
                }
            };

            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(route(&state, req).await) }
                });

                let mut builder = http1::Builder::new();
                builder
                    .timer(TokioTimer::new())
                    .header_read_timeout(header_read_timeout);

                if let Err(err) = builder.serve_connection(io, service).await {
                    error!("Error serving connection: {:?}", err);
                }
            });
        }
    }
}
