//! Range request handling for `/stream/{path}`
//!
//! Every request walks the same steps: resolve metadata (metadata cache, then
//! the store), resolve the Range header against the object size, then either
//! answer 416, serve one range through the content cache, or stream the whole
//! object in `chunk_size` pieces. Any store fetch made on a miss is written
//! back into the matching cache before the bytes are returned.

use crate::config::StreamingConfig;
use crate::content_cache::ContentCache;
use crate::error::{DeliveryError, Result};
use crate::metadata_cache::ObjectMetadataCache;
use crate::metrics::DeliveryMetrics;
use crate::models::{ByteRange, CacheStatus, ObjectMetadata};
use crate::request_analyzer::{RangeOutcome, RequestAnalyzer};
use crate::response_assembler::ResponseAssembler;
use crate::store::StoreClient;
use bytes::Bytes;
use futures::Stream;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Body type of every response the service produces
pub type ResponseBody = UnsyncBoxBody<Bytes, DeliveryError>;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");

pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// JSON error response carrying only the client-safe message
pub fn error_response(err: &DeliveryError, with_body: bool) -> Response<ResponseBody> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = if with_body {
        full_body(serde_json::json!({ "detail": err.client_message() }).to_string())
    } else {
        empty_body()
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// Serves GET, HEAD and OPTIONS for stored objects
#[derive(Clone)]
pub struct StreamHandler {
    store: Arc<StoreClient>,
    metadata_cache: Arc<ObjectMetadataCache>,
    content_cache: Arc<ContentCache>,
    metrics: Arc<DeliveryMetrics>,
    analyzer: RequestAnalyzer,
    assembler: ResponseAssembler,
    chunk_size: u64,
}

impl StreamHandler {
    pub fn new(
        store: Arc<StoreClient>,
        metadata_cache: Arc<ObjectMetadataCache>,
        content_cache: Arc<ContentCache>,
        metrics: Arc<DeliveryMetrics>,
        config: &StreamingConfig,
    ) -> Self {
        StreamHandler {
            store,
            metadata_cache,
            content_cache,
            metrics,
            analyzer: RequestAnalyzer::new(config),
            assembler: ResponseAssembler::new(config.cache_max_age_secs),
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Answer one request for the object at `path`
    ///
    /// Never fails: errors become 404/416/500 responses with a short JSON body.
    pub async fn handle(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path: &str,
    ) -> Response<ResponseBody> {
        let started = Instant::now();

        let mut response = match self.serve(method, headers, path).await {
            Ok(response) => response,
            Err(e) => {
                match e.to_http_status() {
                    500 => error!(
                        "Stream request failed: method={}, path={}, error={}",
                        method, path, e
                    ),
                    _ => debug!(
                        "Stream request rejected: method={}, path={}, error={}",
                        method, path, e
                    ),
                }
                error_response(&e, method != Method::HEAD)
            }
        };
        self.assembler.apply_cors(response.headers_mut());

        let elapsed = started.elapsed();
        let millis = elapsed.as_secs_f64() * 1000.0;
        if let Ok(value) = HeaderValue::from_str(&format!("{:.3}ms", millis)) {
            response.headers_mut().insert(X_RESPONSE_TIME, value);
        }
        self.metrics
            .record_request(method.as_str(), response.status().as_u16(), elapsed);
        response
    }

    async fn serve(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path: &str,
    ) -> Result<Response<ResponseBody>> {
        if method == Method::OPTIONS {
            return Ok(respond(
                StatusCode::OK,
                self.assembler.build_preflight_header(),
                empty_body(),
            ));
        }
        if method != Method::GET && method != Method::HEAD {
            let mut headers = HeaderMap::new();
            headers.insert(ALLOW, HeaderValue::from_static("GET, HEAD, OPTIONS"));
            return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, headers, empty_body()));
        }
        if path.is_empty() {
            return Err(DeliveryError::NotFound("empty object path".to_string()));
        }

        let metadata = self.resolve_metadata(path).await?;

        if method == Method::HEAD {
            let (status, headers) = self.assembler.build_response_header(&metadata, None)?;
            return Ok(respond(status, headers, empty_body()));
        }

        let served = match self.analyzer.resolve(headers, metadata.size) {
            RangeOutcome::Unsatisfiable => return self.unsatisfiable(metadata.size),
            RangeOutcome::Partial(range) => self.serve_partial(path, &metadata, range).await,
            RangeOutcome::Full => self.serve_full(path, &metadata).await,
        };

        match served {
            Err(DeliveryError::InvalidRange(reason)) => {
                self.object_changed(path, &metadata, &reason).await
            }
            other => other,
        }
    }

    fn unsatisfiable(&self, size: u64) -> Result<Response<ResponseBody>> {
        let (status, headers) = self.assembler.build_unsatisfiable_header(size)?;
        Ok(respond(status, headers, empty_body()))
    }

    /// The store refused a range the cached size allowed: the object shrank
    ///
    /// Drops the stale metadata and answers 416 against the size the store
    /// reports now, or the stale size if the store cannot be asked.
    async fn object_changed(
        &self,
        path: &str,
        stale: &ObjectMetadata,
        reason: &str,
    ) -> Result<Response<ResponseBody>> {
        info!(
            "Object changed under cached metadata: path={}, cached_size={}, reason={}",
            path, stale.size, reason
        );
        self.metadata_cache.invalidate(path);

        let size = match self.resolve_metadata(path).await {
            Ok(fresh) => fresh.size,
            Err(e) => {
                debug!("Could not refresh metadata: path={}, error={}", path, e);
                stale.size
            }
        };
        self.unsatisfiable(size)
    }

    async fn serve_partial(
        &self,
        path: &str,
        metadata: &ObjectMetadata,
        range: ByteRange,
    ) -> Result<Response<ResponseBody>> {
        let (status, mut headers) = self.assembler.build_response_header(metadata, Some(range))?;
        let (data, cache_status) = self.fetch_range(path, range).await?;
        headers.insert(X_CACHE, HeaderValue::from_static(cache_status.as_str()));
        Ok(respond(status, headers, full_body(data)))
    }

    async fn serve_full(
        &self,
        path: &str,
        metadata: &ObjectMetadata,
    ) -> Result<Response<ResponseBody>> {
        let (status, mut headers) = self.assembler.build_response_header(metadata, None)?;

        if metadata.size == 0 {
            return Ok(respond(status, headers, empty_body()));
        }

        if metadata.size <= self.chunk_size {
            let range = ByteRange::new(0, metadata.size - 1)?;
            let (data, cache_status) = self.fetch_range(path, range).await?;
            headers.insert(X_CACHE, HeaderValue::from_static(cache_status.as_str()));
            return Ok(respond(status, headers, full_body(data)));
        }

        debug!(
            "Streaming full object: path={}, size={}, chunk_size={}",
            path, metadata.size, self.chunk_size
        );
        let body = StreamBody::new(self.chunks(path.to_string(), metadata.size)).boxed_unsync();
        Ok(respond(status, headers, body))
    }

    /// Lazily fetch `[0, size)` in order, one chunk per poll
    ///
    /// Dropping the stream (client gone) cancels the fetch in flight; chunks
    /// are cached only once fully read.
    fn chunks(
        &self,
        path: String,
        size: u64,
    ) -> impl Stream<Item = std::result::Result<Frame<Bytes>, DeliveryError>> + Send + 'static {
        let handler = self.clone();
        let chunk_size = self.chunk_size;

        async_stream::stream! {
            let mut offset = 0u64;
            while offset < size {
                let end = offset.saturating_add(chunk_size - 1).min(size - 1);
                let range = ByteRange { start: offset, end };
                let item = handler
                    .fetch_range(&path, range)
                    .await
                    .map(|(data, _)| Frame::data(data));

                let failed = item.is_err();
                if let Err(e) = &item {
                    warn!(
                        "Aborting full-body stream: path={}, offset={}, error={}",
                        path, offset, e
                    );
                }
                yield item;
                if failed {
                    break;
                }
                offset = end + 1;
            }
        }
    }

    /// Object metadata through the metadata cache
    ///
    /// # Returns
    /// * `Err(DeliveryError::NotFound)` if the store has no such object
    pub async fn resolve_metadata(&self, path: &str) -> Result<Arc<ObjectMetadata>> {
        if let Some(metadata) = self.metadata_cache.get(path) {
            self.metrics.record_cache_lookup("metadata", true);
            return Ok(metadata);
        }
        self.metrics.record_cache_lookup("metadata", false);

        match self.store.head_metadata(path).await? {
            Some(metadata) => Ok(self.metadata_cache.set(path, metadata)),
            None => Err(DeliveryError::NotFound(path.to_string())),
        }
    }

    /// One range through the content cache, fetching and caching on a miss
    pub async fn fetch_range(&self, path: &str, range: ByteRange) -> Result<(Bytes, CacheStatus)> {
        if let Some(data) = self.content_cache.get(path, range.start, range.end).await {
            self.metrics.record_cache_lookup("content", true);
            self.metrics.record_bytes_served(true, data.len() as u64);
            return Ok((data, CacheStatus::Hit));
        }
        self.metrics.record_cache_lookup("content", false);

        let data = self.store.read_range(path, range).await?;
        if data.len() as u64 != range.size() {
            return Err(DeliveryError::StoreUnavailable(format!(
                "short read for {}: expected {} bytes, got {}",
                range.to_header(),
                range.size(),
                data.len()
            )));
        }

        if let Err(e) = self
            .content_cache
            .put(path, range.start, range.end, data.clone())
            .await
        {
            warn!("Failed to cache range: path={}, range={}, error={}", path, range.to_header(), e);
        }

        self.metrics.record_bytes_served(false, data.len() as u64);
        Ok((data, CacheStatus::Miss))
    }
}

fn respond(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
