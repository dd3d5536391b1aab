//! Engine counters and gauges published through the `metrics` facade.
//!
//! Every update to [`EngineStats`](crate::EngineStats) has a matching metric
//! here. Nothing leaves the process unless the binary installs a recorder,
//! such as the Prometheus exporter.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};
use courier_core::DeliveryTransition;

/// Attempts made, labelled `outcome` = `success` | `failure`.
pub const ATTEMPTS_TOTAL: &str = "courier_delivery_attempts_total";

/// Wall-clock duration of each attempt.
pub const ATTEMPT_DURATION_SECONDS: &str = "courier_delivery_attempt_duration_seconds";

/// Recorded transitions, labelled `transition` = `succeeded` | `retry` | `failed`.
pub const TRANSITIONS_TOTAL: &str = "courier_delivery_transitions_total";

/// Store errors, labelled `operation` = `claim` | `complete`.
pub const STORE_ERRORS_TOTAL: &str = "courier_store_errors_total";

/// Attempts dropped because another worker took over the claim.
pub const LOST_CLAIMS_TOTAL: &str = "courier_lost_claims_total";

/// Deliveries currently being attempted.
pub const IN_FLIGHT_DELIVERIES: &str = "courier_in_flight_deliveries";

/// Running delivery workers.
pub const ACTIVE_WORKERS: &str = "courier_active_workers";

pub(crate) fn record_attempt(success: bool, duration: Duration) {
    let outcome = if success { "success" } else { "failure" };
    counter!(ATTEMPTS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(ATTEMPT_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub(crate) fn record_transition(transition: &DeliveryTransition) {
    let transition = match transition {
        DeliveryTransition::Succeeded => "succeeded",
        DeliveryTransition::Retry { .. } => "retry",
        DeliveryTransition::Failed => "failed",
    };
    counter!(TRANSITIONS_TOTAL, "transition" => transition).increment(1);
}

pub(crate) fn record_store_error(operation: &'static str) {
    counter!(STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub(crate) fn record_lost_claim() {
    counter!(LOST_CLAIMS_TOTAL).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn set_in_flight(count: u64) {
    gauge!(IN_FLIGHT_DELIVERIES).set(count as f64);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn set_active_workers(count: usize) {
    gauge!(ACTIVE_WORKERS).set(count as f64);
}
