//! Prometheus metrics for the Larder server.
//!
//! The `/metrics` endpoint is unauthenticated. Metrics carry no digests or
//! instance names, only aggregate cache activity.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Action Cache
pub static AC_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_ac_hits_total",
        "Action Cache lookups that returned a result",
    )
    .expect("metric creation failed")
});

pub static AC_MISSES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_ac_misses_total",
        "Action Cache lookups with no stored entry",
    )
    .expect("metric creation failed")
});

pub static AC_STALE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_ac_stale_total",
        "Action Cache entries rejected because a referenced blob is missing or the entry is corrupt",
    )
    .expect("metric creation failed")
});

pub static AC_UPDATES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("larder_ac_updates_total", "Action Cache entries written")
        .expect("metric creation failed")
});

// CAS
pub static CAS_BYTES_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_cas_bytes_written_total",
        "Bytes stored in the CAS (new blobs only)",
    )
    .expect("metric creation failed")
});

pub static CAS_BYTES_READ: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("larder_cas_bytes_read_total", "Bytes served from the CAS")
        .expect("metric creation failed")
});

pub static CAS_DEDUPLICATED_WRITES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_cas_deduplicated_writes_total",
        "Uploads whose blob was already present",
    )
    .expect("metric creation failed")
});

pub static INTEGRITY_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "larder_integrity_failures_total",
        "Content that did not match its digest",
    )
    .expect("metric creation failed")
});

pub static REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("larder_requests_total", "Cache operations by method"),
        &["method"],
    )
    .expect("metric creation failed")
});

// Byte Transfer
pub static ACTIVE_TRANSFERS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "larder_active_transfers",
        "Current number of in-flight ByteStream writes",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests can build several routers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(AC_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AC_MISSES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AC_STALE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(AC_UPDATES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CAS_BYTES_WRITTEN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CAS_BYTES_READ.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CAS_DEDUPLICATED_WRITES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INTEGRITY_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUESTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_TRANSFERS.clone()))
            .expect("metric registration failed");
    });
}

/// Count one call of a cache operation.
pub fn record_request(method: &str) {
    REQUESTS.with_label_values(&[method]).inc();
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
