//! cadence - centralized controller for a disaggregated GPU inference
//! service.
//!
//! A fleet of worker nodes hosts GPUs executing pre-compiled batched
//! models. cadence receives per-model inference requests carrying SLO
//! deadlines and dispatches three kinds of actions to workers: load a
//! model's weights into GPU pages, evict them, or execute a batched
//! inference against resident weights. The scheduler maximizes goodput —
//! requests answered within their deadline — under finite paged GPU memory
//! and finite GPU execution time, across many more models than fit in
//! memory at once.
//!
//! # Architecture
//!
//! - One scheduler thread owns all mutable scheduling state and polls its
//!   queues at a sub-millisecond cadence.
//! - Network threads (external transports) push requests and worker
//!   results onto MPSC channels and never block on scheduling.
//! - A telemetry thread drains per-action and per-request records into TSV
//!   files.
//!
//! Model compilation, the worker-side executor, and the wire transports
//! are external collaborators; this crate consumes their schemas.

pub mod api;
pub mod artifact;
pub mod config;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use api::{
    response_channel, ClusterState, InferCallback, InferStatus, InferenceRequest,
    InferenceResponse, ResponseRx, WorkerConnection, WorkerEvent,
};
use config::ControllerConfig;
use scheduler::{DeadlineScheduler, Scheduler, SchedulerError};
use shutdown::{ShutdownCoordinator, ShutdownResult};
use telemetry::{spawn_telemetry_thread, TelemetryHandle, TelemetrySink};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("failed to start telemetry: {0}")]
    Telemetry(#[from] std::io::Error),
}

/// The running controller: scheduler thread, telemetry thread, and the
/// client-facing admission surface.
pub struct Controller {
    scheduler: Arc<DeadlineScheduler>,
    /// Client-visible model names to dense ids, populated at bootstrap.
    catalog: DashMap<String, usize>,
    shutdown: Arc<ShutdownCoordinator>,
    telemetry: Option<TelemetryHandle>,
}

impl Controller {
    /// Boot the controller against a worker fleet. `connections[i]` must be
    /// the connection for `state.workers[i]`.
    pub fn start(
        config: ControllerConfig,
        connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
    ) -> Result<Self, ControllerError> {
        let (sink, telemetry) =
            spawn_telemetry_thread(&config.telemetry, config.scheduler.print_interval_ns)?;
        Self::start_with_sink(config, connections, state, sink, Some(telemetry))
    }

    /// Boot without telemetry files (tests, embedded use).
    pub fn start_quiet(
        config: ControllerConfig,
        connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
    ) -> Result<Self, ControllerError> {
        Self::start_with_sink(config, connections, state, TelemetrySink::disabled(), None)
    }

    fn start_with_sink(
        config: ControllerConfig,
        connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
        sink: TelemetrySink,
        telemetry: Option<TelemetryHandle>,
    ) -> Result<Self, ControllerError> {
        let catalog = DashMap::new();
        for model in &state.models {
            catalog.insert(model.name.clone(), model.id);
        }
        let scheduler = Arc::new(DeadlineScheduler::new(config.scheduler.clone(), sink));
        scheduler.start(connections, state)?;
        Ok(Self {
            scheduler,
            catalog,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            telemetry,
        })
    }

    /// Look up a model id by its client-visible name.
    pub fn resolve_model(&self, name: &str) -> Option<usize> {
        self.catalog.get(name).map(|entry| *entry.value())
    }

    /// Submit a request; the returned receiver resolves exactly once.
    pub fn infer(&self, request: InferenceRequest) -> ResponseRx {
        let (callback, rx) = response_channel();
        self.infer_with_callback(request, callback);
        rx
    }

    /// Submit a request with an explicit completion callback.
    pub fn infer_with_callback(&self, request: InferenceRequest, callback: InferCallback) {
        let Some(guard) = self.shutdown.track() else {
            callback(InferenceResponse::error(InferStatus::InternalError, util::now()));
            return;
        };
        let wrapped: InferCallback = Box::new(move |response| {
            let _guard = guard;
            callback(response);
        });
        self.scheduler.client_infer(request, wrapped);
    }

    /// Handle for worker transports to deliver results and disconnects.
    pub fn worker_event(&self, event: WorkerEvent) {
        self.scheduler.result_from_worker(event);
    }

    /// The scheduling capability, for transports that hold `dyn Scheduler`.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// Drain in-flight requests (bounded), stop the scheduler thread, and
    /// flush telemetry.
    pub fn shutdown(mut self, timeout: Duration) -> ShutdownResult {
        let result = self.shutdown.initiate(timeout);
        self.scheduler.shutdown();
        if let Some(handle) = self.telemetry.take() {
            handle.join();
        }
        result
    }
}
