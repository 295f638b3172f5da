//! Telemetry for the controller.
//!
//! Structured logging goes through `tracing`; per-action and per-request
//! records are drained by a dedicated thread into TSV files, with a
//! periodic throughput summary. Counters and histograms are also mirrored
//! to the `metrics` facade.

mod logging;
mod records;
mod sink;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use records::{ActionRecord, RequestRecord};
pub use sink::{spawn_telemetry_thread, TelemetryHandle, TelemetrySink};

use crate::api::InferStatus;

/// Record one terminal request outcome on the metrics facade.
pub fn record_request_outcome(status: InferStatus, latency_ns: u64) {
    match status {
        InferStatus::Success => {
            metrics::counter!("cadence_requests_success").increment(1);
            metrics::histogram!("cadence_request_latency_ns").record(latency_ns as f64);
        }
        InferStatus::DeadlineExceeded => {
            metrics::counter!("cadence_requests_deadline_exceeded").increment(1);
        }
        InferStatus::ModelNotFound => {
            metrics::counter!("cadence_requests_model_not_found").increment(1);
        }
        InferStatus::InternalError => {
            metrics::counter!("cadence_requests_internal_error").increment(1);
        }
    }
}

/// Record one terminal action outcome on the metrics facade.
pub fn record_action_outcome(kind: &'static str, ok: bool) {
    if ok {
        metrics::counter!("cadence_actions_completed", "kind" => kind).increment(1);
    } else {
        metrics::counter!("cadence_actions_failed", "kind" => kind).increment(1);
    }
}
