//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::Once;
use std::time::Duration;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_http_requests_total", "Total number of HTTP requests"),
        &["method", "status"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_EVICTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_cache_evictions_total", "Total number of entries swept or evicted"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("shelter_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Data access Metrics
    pub static ref DATA_READS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_data_reads_total", "Facade reads by the source that answered"),
        &["dataset", "source"]
    ).expect("metric can be created");
    pub static ref LIVE_QUERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "shelter_live_query_duration_seconds",
            "Live store call duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["operation", "status"]
    ).expect("metric can be created");

    // Connection Metrics
    pub static ref CONNECTION_STATE: IntGauge = IntGauge::new(
        "shelter_connection_state",
        "Live store connection state (0 = uninitialized, 1 = connected, 2 = disconnected)"
    ).expect("metric can be created");
    pub static ref RECONNECT_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_reconnect_attempts_total", "Total number of reconnection attempts"),
        &["status"]
    ).expect("metric can be created");

    // Fallback Metrics
    pub static ref FALLBACK_SYNCS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_fallback_syncs_total", "Total number of fallback snapshot syncs"),
        &["dataset", "status"]
    ).expect("metric can be created");

    // Health Metrics
    pub static ref HEALTH_STATUS: IntGauge = IntGauge::new(
        "shelter_health_status",
        "Derived health status (0 = healthy, 1 = degraded, 2 = at_risk, 3 = unhealthy)"
    ).expect("metric can be created");
    pub static ref CPU_USAGE_PERCENT: Gauge = Gauge::new(
        "shelter_cpu_usage_percent",
        "Global CPU usage percentage"
    ).expect("metric can be created");
    pub static ref MEMORY_USAGE_PERCENT: Gauge = Gauge::new(
        "shelter_memory_usage_percent",
        "System memory usage percentage"
    ).expect("metric can be created");
    pub static ref DISK_USAGE_PERCENT: Gauge = Gauge::new(
        "shelter_disk_usage_percent",
        "Highest disk usage percentage across mounted disks"
    ).expect("metric can be created");
    pub static ref HEALTH_ALERTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_health_alerts_total", "Total number of raised health alerts"),
        &["alert"]
    ).expect("metric can be created");
    pub static ref TEMP_FILES_PRUNED_TOTAL: IntCounter = IntCounter::new(
        "shelter_temp_files_pruned_total",
        "Total number of stale temporary files removed"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("shelter_errors_total", "Total number of errors returned to callers"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
            .expect("HTTP_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("CACHE_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("CACHE_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_EVICTIONS_TOTAL.clone()))
            .expect("CACHE_EVICTIONS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(CACHE_SIZE.clone()))
            .expect("CACHE_SIZE can be registered");
        REGISTRY
            .register(Box::new(DATA_READS_TOTAL.clone()))
            .expect("DATA_READS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(LIVE_QUERY_DURATION_SECONDS.clone()))
            .expect("LIVE_QUERY_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(CONNECTION_STATE.clone()))
            .expect("CONNECTION_STATE can be registered");
        REGISTRY
            .register(Box::new(RECONNECT_ATTEMPTS_TOTAL.clone()))
            .expect("RECONNECT_ATTEMPTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(FALLBACK_SYNCS_TOTAL.clone()))
            .expect("FALLBACK_SYNCS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(HEALTH_STATUS.clone()))
            .expect("HEALTH_STATUS can be registered");
        REGISTRY
            .register(Box::new(CPU_USAGE_PERCENT.clone()))
            .expect("CPU_USAGE_PERCENT can be registered");
        REGISTRY
            .register(Box::new(MEMORY_USAGE_PERCENT.clone()))
            .expect("MEMORY_USAGE_PERCENT can be registered");
        REGISTRY
            .register(Box::new(DISK_USAGE_PERCENT.clone()))
            .expect("DISK_USAGE_PERCENT can be registered");
        REGISTRY
            .register(Box::new(HEALTH_ALERTS_TOTAL.clone()))
            .expect("HEALTH_ALERTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(TEMP_FILES_PRUNED_TOTAL.clone()))
            .expect("TEMP_FILES_PRUNED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}

/// Record one live store call.
pub fn observe_live_query(operation: &str, status: &str, elapsed: Duration) {
    LIVE_QUERY_DURATION_SECONDS
        .with_label_values(&[operation, status])
        .observe(elapsed.as_secs_f64());
}
