//! The deadline-driven infer-and-load scheduler.
//!
//! One thread owns all mutable scheduler state and runs `step` at a
//! sub-millisecond cadence: drain client requests, drain worker events,
//! retire lost actions, dispatch per GPU, and periodically report status.
//! Network threads only ever touch the MPSC queues feeding it.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use crate::api::{
    ActionErrorCode, ClusterState, ErrorResult, InferCallback, InferStatus, InferResult,
    InferenceRequest, InferenceResponse, Reply, WorkerConnection, WorkerEvent,
};
use crate::config::SchedulerConfig;
use crate::scheduler::actions::{
    EvictWeightsAction, InferAction, LoadWeightsAction, OutstandingAction,
};
use crate::scheduler::gpu::Gpu;
use crate::scheduler::model::Model;
use crate::scheduler::request::Request;
use crate::scheduler::work_tracker::WorkTracker;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::telemetry::{self, ActionRecord, RequestRecord, TelemetrySink};
use crate::util;

fn status_str(status: InferStatus) -> &'static str {
    match status {
        InferStatus::Success => "success",
        InferStatus::DeadlineExceeded => "deadline-exceeded",
        InferStatus::ModelNotFound => "model-not-found",
        InferStatus::InternalError => "internal-error",
    }
}

/// Thread-confined scheduler state plus its inbound queues.
pub struct SchedulerCore {
    cfg: SchedulerConfig,
    models: Vec<Model>,
    gpus: Vec<Gpu>,
    tracker: WorkTracker,
    connections: Vec<Box<dyn WorkerConnection>>,
    request_rx: Receiver<(InferenceRequest, InferCallback)>,
    event_rx: Receiver<WorkerEvent>,
    outstanding: HashMap<u64, OutstandingAction>,
    telemetry: TelemetrySink,
    last_status: u64,
}

impl SchedulerCore {
    pub fn new(
        cfg: SchedulerConfig,
        state: &ClusterState,
        connections: Vec<Box<dyn WorkerConnection>>,
        request_rx: Receiver<(InferenceRequest, InferCallback)>,
        event_rx: Receiver<WorkerEvent>,
        telemetry: TelemetrySink,
    ) -> Result<Self, SchedulerError> {
        state.validate()?;
        if connections.len() != state.workers.len() {
            return Err(SchedulerError::ConnectionMismatch {
                connections: connections.len(),
                workers: state.workers.len(),
            });
        }

        let models: Vec<Model> =
            state.models.iter().map(|m| Model::new(m, &cfg)).collect();
        let min_model_pages = models
            .iter()
            .map(|m| m.num_weights_pages)
            .min()
            .unwrap_or(1);

        let mut gpus = Vec::with_capacity(state.gpu_count());
        for worker in &state.workers {
            for spec in &worker.gpus {
                gpus.push(Gpu::new(
                    gpus.len(),
                    worker.id,
                    spec.gpu_index,
                    spec.total_pages,
                    spec.default_clock,
                    models.len(),
                    min_model_pages,
                ));
            }
        }

        let tracker = WorkTracker::new(gpus.len(), models.len(), cfg.slo_ns);
        tracing::info!(
            models = models.len(),
            gpus = gpus.len(),
            workers = connections.len(),
            "scheduler initialized"
        );

        Ok(Self {
            cfg,
            models,
            gpus,
            tracker,
            connections,
            request_rx,
            event_rx,
            outstanding: HashMap::new(),
            telemetry,
            last_status: 0,
        })
    }

    /// One full scheduler cycle at the given instant.
    pub fn step(&mut self, now: u64) {
        self.drain_requests(now);
        self.drain_events(now);
        self.expire_queues(now);
        self.sweep_lost_results(now);
        self.dispatch(now);
        self.maybe_print_status(now);
    }

    /// Drive `step` off the wall clock until cancelled.
    pub fn run(mut self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            self.step(util::now());
            // Deadlines need polling; a bounded nap keeps the loop ≥1 kHz.
            std::thread::sleep(Duration::from_micros(200));
        }
        self.teardown();
    }

    fn drain_requests(&mut self, now: u64) {
        while let Ok((request, callback)) = self.request_rx.try_recv() {
            self.handle_request(request, callback, now);
        }
    }

    fn handle_request(&mut self, request: InferenceRequest, callback: InferCallback, now: u64) {
        if request.model_id >= self.models.len() {
            let user_id = request.user_id;
            let model_id = request.model_id;
            callback(InferenceResponse::error(InferStatus::ModelNotFound, now));
            telemetry::record_request_outcome(InferStatus::ModelNotFound, 0);
            self.telemetry.request(RequestRecord {
                t: now,
                request_id: 0,
                result: status_str(InferStatus::ModelNotFound),
                user_id,
                model_id,
                latency_ns: 0,
                goodput: false,
            });
            return;
        }

        let mut req = Request::new(request, callback, now);
        let model_id = req.model_id;
        let unit = self.models[model_id].estimate(1);
        let size = ((unit as f64 * self.cfg.request_cost_factor) as i64).max(1);
        let demand = self.tracker.add_request(model_id, size, req.deadline - now, now);
        req.set_demand(demand);

        let (request_id, deadline) = (req.id, req.deadline);
        self.models[model_id].enqueue(req);
        let model = &self.models[model_id];
        for gpu in &mut self.gpus {
            gpu.push_request_strategies(model, request_id, deadline, &self.cfg);
        }
    }

    fn drain_events(&mut self, now: u64) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                WorkerEvent::Reply(reply) => self.handle_reply(reply, now),
                WorkerEvent::Disconnected { worker_id } => {
                    self.handle_disconnect(worker_id, now)
                }
            }
        }
    }

    fn handle_reply(&mut self, reply: Reply, now: u64) {
        let id = reply.id();
        let Some(action) = self.outstanding.remove(&id) else {
            // Possible after a controller-side timeout retired the id.
            tracing::warn!(action_id = id, "result for unknown action discarded");
            return;
        };
        match action {
            OutstandingAction::Infer(a) => match reply {
                Reply::Infer(result) => self.infer_success(a, result, now),
                Reply::Error(e) => self.infer_error(a, e, now),
                _ => {
                    tracing::error!(action_id = id, "mismatched result type for infer");
                    self.fail_infer(a, InferStatus::InternalError, "mismatched result", now);
                }
            },
            OutstandingAction::Load(a) => match reply {
                Reply::LoadWeights(result) => self.load_success(a, result.duration, now),
                Reply::Error(e) => self.load_error(a, &e.message, now),
                _ => {
                    tracing::error!(action_id = id, "mismatched result type for load");
                    self.load_error(a, "mismatched result", now);
                }
            },
            OutstandingAction::Evict(a) => {
                let ok = matches!(reply, Reply::EvictWeights(_));
                self.evict_done(a, ok, now);
            }
        }
    }

    // --- Infer completion -------------------------------------------------

    fn infer_success(&mut self, mut action: InferAction, result: InferResult, now: u64) {
        if result.exec.gpu_clock > 0 {
            self.gpus[action.gpu_id].clock = result.exec.gpu_clock;
        }
        // The exec stream ran longer than the reservation; push the
        // timeline so upcoming dispatches see the real backlog.
        if result.exec.duration > action.expected_duration {
            self.gpus[action.gpu_id]
                .exec
                .add_load(result.exec.duration - action.expected_duration);
        }
        self.models[action.model_id].add_measurement(
            action.batch_size,
            result.exec.duration,
            result.exec.gpu_clock.max(1),
        );

        match action.unbatch_output(&result.output) {
            Some(outputs) => {
                for (req, output) in action.requests.iter_mut().zip(outputs) {
                    if let Some(demand) = req.take_demand() {
                        self.tracker.request_completed(demand);
                    }
                    let goodput = req.complete(output, now);
                    let status = if goodput {
                        InferStatus::Success
                    } else {
                        InferStatus::DeadlineExceeded
                    };
                    self.log_request(req, status, now);
                }
                self.log_action(&OutstandingAction::Infer(action), "ok", result.exec.duration, now);
            }
            None => {
                tracing::error!(
                    action_id = action.id,
                    output_len = result.output.len(),
                    batch = action.requests.len(),
                    "batched output does not split evenly"
                );
                self.fail_infer(action, InferStatus::InternalError, "ragged output", now);
            }
        }
    }

    fn infer_error(&mut self, action: InferAction, error: ErrorResult, now: u64) {
        let status = match error.status {
            ActionErrorCode::TooLate => InferStatus::DeadlineExceeded,
            _ => InferStatus::InternalError,
        };
        tracing::debug!(
            action_id = action.id,
            code = ?error.status,
            message = %error.message,
            "infer action failed"
        );
        self.fail_infer(action, status, "error", now);
    }

    fn fail_infer(
        &mut self,
        mut action: InferAction,
        status: InferStatus,
        log_status: &'static str,
        now: u64,
    ) {
        for req in action.requests.iter_mut() {
            if let Some(demand) = req.take_demand() {
                self.tracker.request_completed(demand);
            }
            req.fail(status, now);
            self.log_request(req, status, now);
        }
        self.log_action(&OutstandingAction::Infer(action), log_status, 0, now);
    }

    // --- Load / evict completion -----------------------------------------

    fn load_success(&mut self, action: LoadWeightsAction, duration: u64, now: u64) {
        self.gpus[action.gpu_id].load_success(&action);
        self.tracker
            .load_model_complete(action.gpu_id, action.model_id, true);
        self.models[action.model_id].add_weights_measurement(duration);
        tracing::debug!(
            model_id = action.model_id,
            gpu_id = action.gpu_id,
            version = action.version,
            "weights loaded"
        );
        // Work queued while the load was in flight becomes dispatchable.
        let model = &self.models[action.model_id];
        self.gpus[action.gpu_id].push_queue_strategies(model, &self.cfg);
        self.log_action(&OutstandingAction::Load(action), "ok", duration, now);
    }

    fn load_error(&mut self, action: LoadWeightsAction, message: &str, now: u64) {
        tracing::warn!(
            model_id = action.model_id,
            gpu_id = action.gpu_id,
            reason = message,
            "weights load failed"
        );
        let pages = self.models[action.model_id].num_weights_pages;
        self.gpus[action.gpu_id].load_failed(&action, pages);
        self.tracker
            .load_model_complete(action.gpu_id, action.model_id, false);
        self.log_action(&OutstandingAction::Load(action), "error", 0, now);
    }

    fn evict_done(&mut self, action: EvictWeightsAction, ok: bool, now: u64) {
        let pages = self.models[action.model_id].num_weights_pages;
        self.gpus[action.gpu_id].evict_complete(&action, pages);
        self.log_action(
            &OutstandingAction::Evict(action),
            if ok { "ok" } else { "error" },
            0,
            now,
        );
    }

    // --- Failure sweeps ---------------------------------------------------

    /// Time out queued requests whose deadline has passed outright. The
    /// per-dispatch timeout check (`check_timeouts`) is predictive; this is
    /// the backstop that guarantees every request resolves by its deadline
    /// even when no dispatch ever touches its queue again.
    fn expire_queues(&mut self, now: u64) {
        for m in 0..self.models.len() {
            for mut req in self.models[m].expire_before(now) {
                if let Some(demand) = req.take_demand() {
                    self.tracker.request_completed(demand);
                }
                req.timeout(now);
                self.log_request(&req, InferStatus::DeadlineExceeded, now);
            }
        }
    }

    /// Retire actions whose result is overdue past the grace window.
    fn sweep_lost_results(&mut self, now: u64) {
        let grace = self.cfg.result_grace_ns;
        let lost: Vec<u64> = self
            .outstanding
            .values()
            .filter(|a| a.latest() + grace < now)
            .map(|a| a.id())
            .collect();
        for id in lost {
            let action = self.outstanding.remove(&id).expect("collected above");
            tracing::warn!(action_id = id, kind = action.kind(), "action result overdue");
            match action {
                OutstandingAction::Infer(a) => {
                    self.fail_infer(a, InferStatus::InternalError, "timeout", now)
                }
                OutstandingAction::Load(a) => self.load_error(a, "result overdue", now),
                OutstandingAction::Evict(a) => self.evict_done(a, false, now),
            }
        }
    }

    fn handle_disconnect(&mut self, worker_id: usize, now: u64) {
        tracing::warn!(worker_id, "worker disconnected");
        let gpu_ids: Vec<usize> = self
            .gpus
            .iter()
            .filter(|g| g.worker_id == worker_id)
            .map(|g| g.id)
            .collect();

        let orphaned: Vec<u64> = self
            .outstanding
            .values()
            .filter(|a| gpu_ids.contains(&a.gpu_id()))
            .map(|a| a.id())
            .collect();
        for id in orphaned {
            let action = self.outstanding.remove(&id).expect("collected above");
            match action {
                // Clients see internal-error; the action log keeps the
                // disconnect cause.
                OutstandingAction::Infer(a) => {
                    self.fail_infer(a, InferStatus::InternalError, "disconnected", now)
                }
                // Placement accounting is rebuilt by drop_gpu below.
                other => self.log_action(&other, "disconnected", 0, now),
            }
        }

        for gpu_id in gpu_ids {
            self.tracker.drop_gpu(gpu_id);
            self.gpus[gpu_id].disconnect();
        }
    }

    // --- Dispatch ---------------------------------------------------------

    fn dispatch(&mut self, now: u64) {
        for g in 0..self.gpus.len() {
            let outcome = self.gpus[g].check_pending(&mut self.models, &self.cfg, now);
            for mut req in outcome.timed_out {
                if let Some(demand) = req.take_demand() {
                    self.tracker.request_completed(demand);
                }
                req.timeout(now);
                self.log_request(&req, InferStatus::DeadlineExceeded, now);
            }
            for action in outcome.actions {
                self.register_and_send(action);
            }

            let loads = self.gpus[g].try_load(&self.models, &self.tracker, &self.cfg, now);
            for action in loads {
                self.register_and_send(action);
            }
        }
    }

    fn register_and_send(&mut self, action: OutstandingAction) {
        let wire = match &action {
            OutstandingAction::Infer(a) => a.to_wire(),
            OutstandingAction::Load(a) => a.to_wire(),
            OutstandingAction::Evict(a) => a.to_wire(),
        };
        let worker_id = self.gpus[action.gpu_id()].worker_id;
        self.connections[worker_id].send(wire);
        self.outstanding.insert(action.id(), action);
    }

    // --- Telemetry --------------------------------------------------------

    fn log_request(&self, req: &Request, status: InferStatus, now: u64) {
        let latency = req.departure().unwrap_or(now).saturating_sub(req.arrival);
        telemetry::record_request_outcome(status, latency);
        self.telemetry.request(RequestRecord {
            t: now,
            request_id: req.id,
            result: status_str(status),
            user_id: req.user_id,
            model_id: req.model_id,
            latency_ns: latency,
            goodput: status == InferStatus::Success,
        });
    }

    fn log_action(
        &self,
        action: &OutstandingAction,
        status: &'static str,
        worker_duration: u64,
        now: u64,
    ) {
        telemetry::record_action_outcome(action.kind(), status == "ok");
        let (sent_at, batch_size) = match action {
            OutstandingAction::Infer(a) => (a.sent_at, a.batch_size),
            OutstandingAction::Load(a) => (a.sent_at, 0),
            OutstandingAction::Evict(a) => (a.sent_at, 0),
        };
        let gpu = &self.gpus[action.gpu_id()];
        self.telemetry.action(ActionRecord {
            t: now,
            action_id: action.id(),
            action_type: action.kind(),
            status,
            worker_id: gpu.worker_id,
            gpu_id: action.gpu_id(),
            model_id: match action {
                OutstandingAction::Infer(a) => a.model_id,
                OutstandingAction::Load(a) => a.model_id,
                OutstandingAction::Evict(a) => a.model_id,
            },
            batch_size,
            controller_action_duration_ns: now.saturating_sub(sent_at),
            worker_exec_duration_ns: worker_duration,
        });
    }

    fn maybe_print_status(&mut self, now: u64) {
        if now.saturating_sub(self.last_status) < self.cfg.print_interval_ns {
            return;
        }
        self.last_status = now;
        for gpu in &self.gpus {
            tracing::info!(
                gpu_id = gpu.id,
                worker_id = gpu.worker_id,
                alive = gpu.alive,
                loaded = gpu.loaded_count(),
                loading = gpu.loading_count(),
                free_pages = gpu.free_pages,
                strategies = gpu.strategies.len(),
                "gpu status"
            );
        }
        tracing::info!(outstanding = self.outstanding.len(), "controller status");
    }

    /// Fail everything still owed a response. Queued requests fire their
    /// callbacks through their Drop safety net when the arenas unwind.
    fn teardown(mut self) {
        let now = util::now();
        while let Ok((request, callback)) = self.request_rx.try_recv() {
            let _ = request;
            callback(InferenceResponse::error(InferStatus::InternalError, now));
        }
        for (_, action) in self.outstanding.drain() {
            if let OutstandingAction::Infer(mut a) = action {
                for req in a.requests.iter_mut() {
                    req.fail(InferStatus::InternalError, now);
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    // --- Read-only views for tests and status endpoints -------------------

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn gpus(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn tracker(&self) -> &WorkTracker {
        &self.tracker
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}

struct Inbound {
    request_rx: Receiver<(InferenceRequest, InferCallback)>,
    event_rx: Receiver<WorkerEvent>,
    /// Moved into the core thread at start so the telemetry channel closes
    /// when the core exits.
    telemetry: TelemetrySink,
}

/// Thread-spawning front half of the scheduler. Network threads talk to it
/// through the `Scheduler` trait; all real work happens on the core thread.
pub struct DeadlineScheduler {
    cfg: SchedulerConfig,
    request_tx: Sender<(InferenceRequest, InferCallback)>,
    event_tx: Sender<WorkerEvent>,
    inbound: parking_lot::Mutex<Option<Inbound>>,
    thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DeadlineScheduler {
    pub fn new(cfg: SchedulerConfig, telemetry: TelemetrySink) -> Self {
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        Self {
            cfg,
            request_tx,
            event_tx,
            inbound: parking_lot::Mutex::new(Some(Inbound {
                request_rx,
                event_rx,
                telemetry,
            })),
            thread: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the scheduler thread and wait for it to finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Scheduler for DeadlineScheduler {
    fn start(
        &self,
        connections: Vec<Box<dyn WorkerConnection>>,
        state: ClusterState,
    ) -> Result<(), SchedulerError> {
        let Some(inbound) = self.inbound.lock().take() else {
            return Err(SchedulerError::AlreadyStarted);
        };
        let core = SchedulerCore::new(
            self.cfg.clone(),
            &state,
            connections,
            inbound.request_rx,
            inbound.event_rx,
            inbound.telemetry,
        )?;
        let cancel = self.cancel.clone();
        let handle = std::thread::Builder::new()
            .name("cadence-scheduler".into())
            .spawn(move || core.run(cancel))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn client_infer(&self, request: InferenceRequest, callback: InferCallback) {
        if let Err(send) = self.request_tx.send((request, callback)) {
            // Core thread is gone; answer the client rather than hang it.
            let (_, callback) = send.into_inner();
            callback(InferenceResponse::error(InferStatus::InternalError, util::now()));
        }
    }

    fn result_from_worker(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl Drop for DeadlineScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}
