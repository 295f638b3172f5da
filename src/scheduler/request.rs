//! Request lifecycle: admission to terminal callback.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::{InferCallback, InferStatus, InferenceRequest, InferenceResponse};
use crate::scheduler::work_tracker::Demand;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// One admitted inference request.
///
/// Owned by its model's queue until dispatched, then by the InferAction
/// until a terminal result. The callback fires exactly once; the demand
/// handle is surrendered exactly once alongside it.
pub struct Request {
    pub id: u64,
    pub model_id: usize,
    pub user_id: u32,
    pub input: Vec<u8>,
    pub arrival: u64,
    pub deadline: u64,
    pub executing: bool,
    demand: Option<Demand>,
    callback: Option<InferCallback>,
    departure: Option<u64>,
}

impl Request {
    pub fn new(request: InferenceRequest, callback: InferCallback, now: u64) -> Self {
        Self {
            id: next_request_id(),
            model_id: request.model_id,
            user_id: request.user_id,
            input: request.input,
            arrival: now,
            deadline: now + request.slo_ns,
            executing: false,
            demand: None,
            callback: Some(callback),
            departure: None,
        }
    }

    pub fn set_demand(&mut self, demand: Demand) {
        self.demand = Some(demand);
    }

    /// Surrender the demand handle; the caller credits the work tracker.
    pub fn take_demand(&mut self) -> Option<Demand> {
        self.demand.take()
    }

    pub fn has_completed(&self) -> bool {
        self.callback.is_none()
    }

    pub fn departure(&self) -> Option<u64> {
        self.departure
    }

    /// Head-of-queue drop: the deadline can no longer be met.
    pub fn timeout(&mut self, now: u64) {
        self.fire(InferenceResponse::error(InferStatus::DeadlineExceeded, now), now);
    }

    /// Deliver a successful execution. Returns true if it counted as
    /// goodput; a result past the deadline is delivered as an SLO violation.
    pub fn complete(&mut self, output: Vec<u8>, now: u64) -> bool {
        if now <= self.deadline {
            self.fire(InferenceResponse { status: InferStatus::Success, output, departure: now }, now);
            true
        } else {
            self.fire(InferenceResponse::error(InferStatus::DeadlineExceeded, now), now);
            false
        }
    }

    /// Terminal failure with an explicit status.
    pub fn fail(&mut self, status: InferStatus, now: u64) {
        self.fire(InferenceResponse::error(status, now), now);
    }

    fn fire(&mut self, response: InferenceResponse, now: u64) {
        match self.callback.take() {
            Some(cb) => {
                self.departure = Some(now);
                cb(response);
            }
            None => {
                debug_assert!(false, "request {} completed twice", self.id);
                tracing::error!(request_id = self.id, "duplicate completion suppressed");
            }
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        // Teardown safety net: a request dropped without a terminal result
        // still owes its client a response.
        if let Some(cb) = self.callback.take() {
            tracing::warn!(request_id = self.id, "request dropped before completion");
            cb(InferenceResponse::error(InferStatus::InternalError, self.arrival));
        }
    }
}
