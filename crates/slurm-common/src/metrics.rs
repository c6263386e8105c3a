//! OpenTelemetry instruments for controller observability
//!
//! Instruments are registered lazily against the global meter, so they are
//! no-ops until [`crate::telemetry::init_telemetry`] installs an exporter.

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("slurm-operator"));

/// Histogram of reconcile duration
///
/// Labels:
/// - `controller`: cluster, nodeset
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("slurm_operator_reconcile_duration_seconds")
        .with_description("Duration of reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconciles
///
/// Labels:
/// - `controller`: cluster, nodeset
/// - `retryable`: true, false
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("slurm_operator_reconcile_errors_total")
        .with_description("Total number of reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of Slurm client registry changes
///
/// Labels:
/// - `op`: add, remove
pub static REGISTRY_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("slurm_operator_registry_operations_total")
        .with_description("Slurm client registry additions and removals")
        .with_unit("{operations}")
        .build()
});

/// Record one finished reconcile
pub fn record_reconcile(controller: &'static str, elapsed: Duration, error: Option<&crate::Error>) {
    let result = if error.is_some() { "error" } else { "success" };
    RECONCILE_DURATION.record(
        elapsed.as_secs_f64(),
        &[
            KeyValue::new("controller", controller),
            KeyValue::new("result", result),
        ],
    );
    if let Some(err) = error {
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("controller", controller),
                KeyValue::new("retryable", err.is_retryable()),
            ],
        );
    }
}

/// Record one registry addition (`"add"`) or removal (`"remove"`)
pub fn record_registry_operation(op: &'static str) {
    REGISTRY_OPERATIONS.add(1, &[KeyValue::new("op", op)]);
}
