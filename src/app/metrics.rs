//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! All metrics are exposed via the /metrics endpoint when the API is enabled.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Traffic Metrics ===

    /// Total bytes read from the device and forwarded
    pub static ref TRAFFIC_BYTES_UPLOADED: IntCounter = IntCounter::new(
        "tunrelay_traffic_bytes_uploaded_total",
        "Total bytes uploaded"
    ).unwrap();

    /// Total bytes written back to the device
    pub static ref TRAFFIC_BYTES_DOWNLOADED: IntCounter = IntCounter::new(
        "tunrelay_traffic_bytes_downloaded_total",
        "Total bytes downloaded"
    ).unwrap();

    /// Packets forwarded per direction
    pub static ref TRAFFIC_PACKETS: IntCounterVec = IntCounterVec::new(
        Opts::new("tunrelay_traffic_packets_total", "Packets forwarded per direction"),
        &["direction"]
    ).unwrap();

    /// Packets dropped, by reason
    pub static ref PACKETS_DROPPED: IntCounterVec = IntCounterVec::new(
        Opts::new("tunrelay_packets_dropped_total", "Packets dropped, by reason"),
        &["reason"]
    ).unwrap();

    // === Session Metrics ===

    /// Sessions created per route action
    pub static ref SESSIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tunrelay_sessions_total", "Sessions created per route action"),
        &["action"]
    ).unwrap();

    /// Currently tracked sessions
    pub static ref SESSIONS_ACTIVE: IntGauge = IntGauge::new(
        "tunrelay_sessions_active",
        "Number of currently tracked sessions"
    ).unwrap();

    /// Session lifetime
    pub static ref SESSION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "tunrelay_session_duration_seconds",
            "Session duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["action"]
    ).unwrap();

    // === Router Metrics ===

    /// Rule hits per rule
    pub static ref ROUTER_RULE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("tunrelay_router_rule_hits_total", "Number of times each routing rule was matched"),
        &["rule"]
    ).unwrap();

    /// Total routing decisions
    pub static ref ROUTER_DECISIONS_TOTAL: IntCounter = IntCounter::new(
        "tunrelay_router_decisions_total",
        "Total number of routing decisions made"
    ).unwrap();

    // === Transport Metrics ===

    /// Send errors per multiplexer path
    pub static ref TRANSPORT_SEND_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("tunrelay_transport_send_failures_total", "Send errors per path"),
        &["path"]
    ).unwrap();

    /// Sessions reported failed by a multiplexer
    pub static ref TRANSPORT_SESSIONS_FAILED: IntCounter = IntCounter::new(
        "tunrelay_transport_sessions_failed_total",
        "Sessions whose transport path failed"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Traffic metrics
    REGISTRY.register(Box::new(TRAFFIC_BYTES_UPLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_BYTES_DOWNLOADED.clone())).ok();
    REGISTRY.register(Box::new(TRAFFIC_PACKETS.clone())).ok();
    REGISTRY.register(Box::new(PACKETS_DROPPED.clone())).ok();

    // Session metrics
    REGISTRY.register(Box::new(SESSIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SESSIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(SESSION_DURATION_SECONDS.clone())).ok();

    // Router metrics
    REGISTRY.register(Box::new(ROUTER_RULE_HITS.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_DECISIONS_TOTAL.clone())).ok();

    // Transport metrics
    REGISTRY.register(Box::new(TRANSPORT_SEND_FAILURES.clone())).ok();
    REGISTRY.register(Box::new(TRANSPORT_SESSIONS_FAILED.clone())).ok();
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bytes per second to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    if bytes_per_sec >= MB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}
