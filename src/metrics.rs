//! Prometheus metrics for the delivery service
//!
//! Every metric is registered on a private [`Registry`] owned by
//! [`DeliveryMetrics`], so independent instances (one per test, for example)
//! never collide.

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metrics collector for stream serving, caches and the store client
#[derive(Clone)]
pub struct DeliveryMetrics {
    registry: Registry,

    /// Requests by method and response status
    requests_total: IntCounterVec,

    /// Time until response headers are ready, by method
    request_duration_seconds: HistogramVec,

    /// Cache lookups by cache ("metadata", "content") and result ("hit", "miss")
    cache_lookups_total: IntCounterVec,

    /// Store calls by operation and outcome ("ok", "not_found", "error")
    store_operations_total: IntCounterVec,

    /// Connections dropped after credential expiry
    store_reconnects_total: IntCounter,

    /// Payload bytes handed to clients by source ("cache", "store")
    bytes_served_total: CounterVec,

    /// Invalidation calls and the entries they removed, by scope
    invalidations_total: IntCounterVec,
    invalidated_entries_total: IntCounterVec,
}

impl DeliveryMetrics {
    /// Create metrics on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create metrics on the given registry
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let requests_total = IntCounterVec::new(
            Opts::new("media_delivery_requests_total", "Total number of HTTP requests"),
            &["method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "media_delivery_request_duration_seconds",
                "Time to produce response headers in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["method"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new("media_delivery_cache_lookups_total", "Cache lookups by cache and result"),
            &["cache", "result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let store_operations_total = IntCounterVec::new(
            Opts::new(
                "media_delivery_store_operations_total",
                "Object store calls by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(store_operations_total.clone()))?;

        let store_reconnects_total = IntCounter::new(
            "media_delivery_store_reconnects_total",
            "Store connections replaced after credential expiry",
        )?;
        registry.register(Box::new(store_reconnects_total.clone()))?;

        let bytes_served_total = CounterVec::new(
            Opts::new("media_delivery_bytes_served_total", "Payload bytes served by source"),
            &["source"],
        )?;
        registry.register(Box::new(bytes_served_total.clone()))?;

        let invalidations_total = IntCounterVec::new(
            Opts::new("media_delivery_invalidations_total", "Cache invalidation calls by scope"),
            &["scope"],
        )?;
        registry.register(Box::new(invalidations_total.clone()))?;

        let invalidated_entries_total = IntCounterVec::new(
            Opts::new(
                "media_delivery_invalidated_entries_total",
                "Cache entries removed by invalidation, by scope",
            ),
            &["scope"],
        )?;
        registry.register(Box::new(invalidated_entries_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            cache_lookups_total,
            store_operations_total,
            store_reconnects_total,
            bytes_served_total,
            invalidations_total,
            invalidated_entries_total,
        })
    }

    pub fn record_request(&self, method: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method])
            .observe(duration.as_secs_f64());
    }

    /// Record a cache lookup
    ///
    /// # Arguments
    /// * `cache` - "metadata" or "content"
    /// * `hit` - Whether the lookup was served from the cache
    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[cache, result])
            .inc();
    }

    pub fn record_store_operation(&self, operation: &str, outcome: &str) {
        self.store_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn record_reconnect(&self) {
        self.store_reconnects_total.inc();
    }

    pub fn record_bytes_served(&self, from_cache: bool, bytes: u64) {
        let source = if from_cache { "cache" } else { "store" };
        self.bytes_served_total
            .with_label_values(&[source])
            .inc_by(bytes as f64);
    }

    /// Record an invalidation call ("object", "content_all", "metadata_all")
    pub fn record_invalidation(&self, scope: &str, entries: usize) {
        self.invalidations_total.with_label_values(&[scope]).inc();
        self.invalidated_entries_total
            .with_label_values(&[scope])
            .inc_by(entries as u64);
    }

    /// Cache lookups recorded so far for one cache and result
    pub fn cache_lookups(&self, cache: &str, hit: bool) -> u64 {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total
            .with_label_values(&[cache, result])
            .get()
    }

    pub fn reconnects(&self) -> u64 {
        self.store_reconnects_total.get()
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
