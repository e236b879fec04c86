//! Metric instrument factories for leadpool.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"leadpool"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for leadpool instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("leadpool")
}

/// Counter: download requests submitted.
/// Labels: `result` ("auto_approved" | "pending" | "insufficient").
pub fn requests_submitted() -> Counter<u64> {
    meter()
        .u64_counter("leadpool.requests.submitted")
        .with_description("Number of download requests submitted")
        .build()
}

/// Counter: admin decisions on pending requests.
/// Labels: `decision`.
pub fn requests_decided() -> Counter<u64> {
    meter()
        .u64_counter("leadpool.requests.decided")
        .with_description("Number of request decisions")
        .build()
}

/// Counter: records moved between custody states.
/// Labels: `from`, `to`.
pub fn record_transitions() -> Counter<u64> {
    meter()
        .u64_counter("leadpool.records.transitions")
        .with_description("Number of record status transitions")
        .build()
}

/// Counter: corrections applied by the consistency auditor.
/// Labels: `flow` ("stuck" | "recovery"), `target`.
pub fn repairs_applied() -> Counter<u64> {
    meter()
        .u64_counter("leadpool.repairs.applied")
        .with_description("Number of records corrected by repair flows")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leadpool.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
