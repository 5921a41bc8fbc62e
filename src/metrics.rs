//! Prometheus metrics for the merchant backend.
//!
//! Exposed on `GET /metrics` by the axum router in [`crate::api`]; this
//! module only owns the registry and the recording helpers the rest of the
//! crate calls into.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    pub static ref PAY_REQUESTS: CounterVec = register_counter_vec!(
        "merchant_pay_requests_total",
        "Total /pay requests handled, by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref PAY_LATENCY: HistogramVec = register_histogram_vec!(
        "merchant_pay_latency_seconds",
        "Time to resolve a /pay request end to end",
        &["outcome"],
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub static ref DEPOSITS_SUBMITTED: CounterVec = register_counter_vec!(
        "merchant_deposits_submitted_total",
        "Deposits submitted to an exchange, by exchange URL and outcome",
        &["exchange", "outcome"]
    )
    .unwrap();

    pub static ref PROPOSALS_SIGNED: CounterVec = register_counter_vec!(
        "merchant_proposals_signed_total",
        "Contract proposals signed, by instance id",
        &["instance"]
    )
    .unwrap();

    pub static ref TRANSFER_RECONCILIATIONS: CounterVec = register_counter_vec!(
        "merchant_transfer_reconciliations_total",
        "Track-transfer reconciliations run, by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref EXCHANGE_KEY_REFRESH_FAILURES: CounterVec = register_counter_vec!(
        "merchant_exchange_key_refresh_failures_total",
        "Failed /keys refreshes, by exchange URL",
        &["exchange"]
    )
    .unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "merchant_up",
        "Whether the merchant backend is up and running"
    )
    .unwrap();
}

/// Render the current registry in Prometheus text exposition format, for the
/// `GET /metrics` handler.
pub fn encode() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let _ = encoder.encode(&metric_families, &mut buffer);
    buffer
}

pub fn record_pay_outcome(outcome: &str, seconds: f64) {
    PAY_REQUESTS.with_label_values(&[outcome]).inc();
    PAY_LATENCY.with_label_values(&[outcome]).observe(seconds);
}

pub fn record_deposit(exchange: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    DEPOSITS_SUBMITTED
        .with_label_values(&[exchange, outcome])
        .inc();
}

pub fn record_proposal_signed(instance: &str) {
    PROPOSALS_SIGNED.with_label_values(&[instance]).inc();
}

pub fn record_transfer_reconciliation(outcome: &str) {
    TRANSFER_RECONCILIATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_key_refresh_failure(exchange: &str) {
    EXCHANGE_KEY_REFRESH_FAILURES
        .with_label_values(&[exchange])
        .inc();
}
