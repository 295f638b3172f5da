//! Scheduling: demand tracking, batching, placement, and dispatch.

mod actions;
mod deadline;
mod estimator;
mod gpu;
mod model;
mod release_queue;
mod request;
mod strategy;
mod tracker;
mod work_tracker;

pub use actions::{
    next_action_id, EvictWeightsAction, InferAction, LoadWeightsAction, OutstandingAction,
};
pub use deadline::{DeadlineScheduler, SchedulerCore};
pub use estimator::SlidingWindowEstimator;
pub use gpu::{DispatchOutcome, Gpu, Instance, PendingLoad};
pub use model::Model;
pub use release_queue::TimedReleaseQueue;
pub use request::Request;
pub use strategy::{InferStrategy, StrategyQueue};
pub use tracker::WorkerTracker;
pub use work_tracker::{Demand, WorkTracker};

use thiserror::Error;

use crate::api::{
    ClusterState, InferCallback, InferStatus, InferenceRequest, InferenceResponse, StateError,
    WorkerConnection, WorkerEvent,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("{connections} worker connections for {workers} workers")]
    ConnectionMismatch { connections: usize, workers: usize },

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(String),
}

/// The controller's scheduling capability: boot against a cluster, admit
/// client requests, and absorb worker results. Implementations must never
/// block the calling network threads.
pub trait Scheduler: Send + Sync {
    fn start(
        &self,
        connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
    ) -> Result<(), SchedulerError>;

    fn client_infer(&self, request: InferenceRequest, callback: InferCallback);

    fn result_from_worker(&self, event: WorkerEvent);
}

/// Inert scheduler for exercising transports: every request is answered
/// immediately with an empty success, every worker event is counted and
/// dropped.
#[derive(Default)]
pub struct StubScheduler {
    requests: std::sync::atomic::AtomicU64,
    events: std::sync::atomic::AtomicU64,
}

impl StubScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn events_seen(&self) -> u64 {
        self.events.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Scheduler for StubScheduler {
    fn start(
        &self,
        _connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
    ) -> Result<(), SchedulerError> {
        state.validate()?;
        Ok(())
    }

    fn client_infer(&self, _request: InferenceRequest, callback: InferCallback) {
        self.requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        callback(InferenceResponse {
            status: InferStatus::Success,
            output: Vec::new(),
            departure: crate::util::now(),
        });
    }

    fn result_from_worker(&self, _event: WorkerEvent) {
        self.events.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
