//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use std::sync::Once;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Inbox Metrics
    pub static ref INBOX_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_inbox_activities_received_total", "Total number of activities received on the inbox"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INBOX_RESPONSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_inbox_responses_total", "Inbox responses by HTTP status"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DIALECT_CLASSIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_dialect_classifications_total", "Inbound activities by addressing dialect"),
        &["dialect"]
    ).expect("metric can be created");
    pub static ref UNWRAP_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_unwrap_failures_total", "Nested activities that could not be unwrapped and were acknowledged anyway"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_DELAY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedirelay_federation_delay_seconds",
            "Seconds between an activity's published timestamp and its arrival"
        ).buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["activity_type"]
    ).expect("metric can be created");

    // Membership Metrics
    pub static ref MEMBERSHIP_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedirelay_membership_size", "Current number of registered servers"),
        &["collection"]
    ).expect("metric can be created");
    pub static ref RELAY_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_relay_events_total", "Membership side-effect events"),
        &["event"]
    ).expect("metric can be created");

    // Delivery Metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_deliveries_total", "Outbound delivery outcomes"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "fedirelay_delivery_duration_seconds",
            "Duration of a single outbound delivery attempt"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"]
    ).expect("metric can be created");
    pub static ref REMOTE_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_remote_fetches_total", "Remote document fetches"),
        &["kind", "status"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedirelay_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Later calls are no-ops.
pub fn init_metrics() {
    INIT.call_once(register_all);
}

fn register_all() {
    REGISTRY
        .register(Box::new(INBOX_ACTIVITIES_RECEIVED.clone()))
        .expect("INBOX_ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(INBOX_RESPONSES_TOTAL.clone()))
        .expect("INBOX_RESPONSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DIALECT_CLASSIFICATIONS.clone()))
        .expect("DIALECT_CLASSIFICATIONS can be registered");
    REGISTRY
        .register(Box::new(UNWRAP_FAILURES_TOTAL.clone()))
        .expect("UNWRAP_FAILURES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_DELAY_SECONDS.clone()))
        .expect("FEDERATION_DELAY_SECONDS can be registered");
    REGISTRY
        .register(Box::new(MEMBERSHIP_SIZE.clone()))
        .expect("MEMBERSHIP_SIZE can be registered");
    REGISTRY
        .register(Box::new(RELAY_EVENTS_TOTAL.clone()))
        .expect("RELAY_EVENTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(REMOTE_FETCHES_TOTAL.clone()))
        .expect("REMOTE_FETCHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Record one delivery outcome.
pub fn observe_delivery(outcome: &str) {
    DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
}
