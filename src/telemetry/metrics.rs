//! Metric instrument factories for okra-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Instruments come from the `"okra-rs"` meter; with no provider installed
//! they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("okra-rs")
}

/// Counter: items scheduled.
/// Labels: `collection`, `result` ("ok" | "error").
pub fn items_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("okra.items.scheduled")
        .with_description("Number of work items scheduled")
        .build()
}

/// Counter: claim attempts.
/// Labels: `collection`, `result` ("claimed" | "empty" | "error").
pub fn claims() -> Counter<u64> {
    meter()
        .u64_counter("okra.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: lease renewals.
/// Labels: `collection`, `result` ("renewed" | "lost" | "error").
pub fn heartbeats() -> Counter<u64> {
    meter()
        .u64_counter("okra.heartbeats")
        .with_description("Number of lease renewals")
        .build()
}

/// Counter: deletes, including poll acknowledgements.
/// Labels: `collection`, `result` ("deleted" | "missing" | "error").
pub fn deletes() -> Counter<u64> {
    meter()
        .u64_counter("okra.deletes")
        .with_description("Number of work item deletes")
        .build()
}

/// Counter: items finished by a worker.
/// Labels: `collection`, `outcome` ("completed" | "failed" | "lease_lost").
pub fn worker_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("okra.worker.outcomes")
        .with_description("Work items processed by workers, by outcome")
        .build()
}

/// Histogram: store round-trip duration in milliseconds.
/// Labels: `operation`.
pub fn store_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("okra.store.duration_ms")
        .with_description("Store round-trip duration in milliseconds")
        .with_unit("ms")
        .build()
}
