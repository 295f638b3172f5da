//! Shared test harness: a mock worker fleet driven on a virtual clock.

#![allow(dead_code)]

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Sender};

use cadence::api::{
    Action, ActionErrorCode, BatchedModelState, ClusterState, ErrorResult, ExecProfile,
    GpuSpec, InferCallback, InferResult, InferStatus, InferenceRequest, InferenceResponse,
    LoadWeightsResult, Reply, WorkerConnection, WorkerEvent, WorkerState,
    EvictWeightsResult,
};
use cadence::config::SchedulerConfig;
use cadence::scheduler::SchedulerCore;
use cadence::telemetry::TelemetrySink;

pub const MS: u64 = 1_000_000;

/// Connection that records every action for the simulation to answer.
pub struct RecordingConnection {
    worker_id: usize,
    sent: Arc<Mutex<Vec<Action>>>,
}

impl WorkerConnection for RecordingConnection {
    fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn send(&self, action: Action) {
        self.sent.lock().unwrap().push(action);
    }
}

/// Per-request observation: submission instant, relative SLO, and every
/// response delivered (exactly one, if the scheduler is correct).
#[derive(Default)]
pub struct StatusLog {
    entries: Arc<Mutex<HashMap<u32, LogEntry>>>,
}

struct LogEntry {
    submitted_at: u64,
    slo_ns: u64,
    responses: Vec<InferenceResponse>,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self, user_id: u32, submitted_at: u64, slo_ns: u64) -> InferCallback {
        let entries = self.entries.clone();
        let mut map = entries.lock().unwrap();
        map.entry(user_id).or_insert(LogEntry { submitted_at, slo_ns, responses: Vec::new() });
        drop(map);
        Box::new(move |response| {
            entries
                .lock()
                .unwrap()
                .get_mut(&user_id)
                .expect("registered at submit")
                .responses
                .push(response);
        })
    }

    pub fn total(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn responded(&self) -> usize {
        self.entries.lock().unwrap().values().filter(|e| !e.responses.is_empty()).count()
    }

    pub fn count_status(&self, status: InferStatus) -> usize {
        self.entries
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.responses.iter().any(|r| r.status == status))
            .count()
    }

    /// Every request received exactly one terminal response.
    pub fn assert_exactly_once(&self) {
        for (user, entry) in self.entries.lock().unwrap().iter() {
            assert_eq!(
                entry.responses.len(),
                1,
                "request {user} fired {} callbacks",
                entry.responses.len()
            );
        }
    }

    /// No success was delivered past its deadline (with one tick of slack
    /// for channel handoff between submission and admission).
    pub fn assert_no_late_success(&self, tick: u64) {
        for (user, entry) in self.entries.lock().unwrap().iter() {
            for response in &entry.responses {
                if response.status == InferStatus::Success {
                    assert!(
                        response.departure <= entry.submitted_at + tick + entry.slo_ns,
                        "request {user} succeeded past its deadline"
                    );
                }
            }
        }
    }
}

struct PendingReply {
    at: u64,
    seq: u64,
    event: WorkerEvent,
}

impl PartialEq for PendingReply {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for PendingReply {}
impl PartialOrd for PendingReply {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingReply {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Scheduler core plus a simulated worker fleet on a virtual clock.
///
/// Each pump tick steps the core, captures freshly dispatched actions, and
/// answers them after the configured delays, honoring each action's
/// earliest/latest window the way a real worker would.
pub struct Sim {
    pub core: SchedulerCore,
    pub request_tx: Sender<(InferenceRequest, InferCallback)>,
    pub event_tx: Sender<WorkerEvent>,
    pub now: u64,
    /// Every action ever dispatched, in order.
    pub log: Vec<Action>,
    sent: Arc<Mutex<Vec<Action>>>,
    pending: BinaryHeap<Reverse<PendingReply>>,
    seq: u64,
    /// Worker-side execution time for a batch-1 Infer.
    pub exec_ns: u64,
    /// Additional execution time per extra batched request.
    pub exec_step_ns: u64,
    pub load_ns: u64,
    pub evict_ns: u64,
    pub gpu_clock: u32,
    /// When false, dispatched actions are recorded but never answered.
    pub respond: bool,
    /// Extra per-step invariant checking.
    pub check_invariants: bool,
}

impl Sim {
    pub fn new(state: ClusterState, cfg: SchedulerConfig) -> Self {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let connections: Vec<Box<dyn WorkerConnection>> = state
            .workers
            .iter()
            .map(|w| {
                Box::new(RecordingConnection { worker_id: w.id, sent: sent.clone() })
                    as Box<dyn WorkerConnection>
            })
            .collect();
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let core = SchedulerCore::new(
            cfg,
            &state,
            connections,
            request_rx,
            event_rx,
            TelemetrySink::disabled(),
        )
        .expect("valid cluster");
        Self {
            core,
            request_tx,
            event_tx,
            now: 0,
            log: Vec::new(),
            sent,
            pending: BinaryHeap::new(),
            seq: 0,
            exec_ns: 5 * MS,
            exec_step_ns: 0,
            load_ns: 8 * MS,
            evict_ns: MS,
            gpu_clock: 1380,
            respond: true,
            check_invariants: true,
        }
    }

    pub fn submit(&self, log: &StatusLog, user_id: u32, model_id: usize, slo_ns: u64) {
        let callback = log.callback(user_id, self.now, slo_ns);
        self.request_tx
            .send((
                InferenceRequest { user_id, model_id, slo_ns, input: vec![user_id as u8; 8] },
                callback,
            ))
            .expect("core alive");
    }

    /// Advance the virtual clock to `until`, stepping every `tick`.
    pub fn pump_until(&mut self, until: u64, tick: u64) {
        while self.now < until {
            self.now += tick;
            self.step_once();
        }
    }

    fn step_once(&mut self) {
        // Deliver worker replies that have come due.
        while let Some(Reverse(top)) = self.pending.peek() {
            if top.at > self.now {
                break;
            }
            let Reverse(reply) = self.pending.pop().expect("peeked entry");
            self.event_tx.send(reply.event).expect("core alive");
        }

        self.core.step(self.now);

        let fresh: Vec<Action> = std::mem::take(&mut *self.sent.lock().unwrap());
        for action in fresh {
            if self.respond {
                self.answer(&action);
            }
            self.log.push(action);
        }

        if self.check_invariants {
            self.assert_invariants();
        }
    }

    pub fn exec_for(&self, batch_size: u32) -> u64 {
        self.exec_ns + (batch_size as u64 - 1) * self.exec_step_ns
    }

    fn answer(&mut self, action: &Action) {
        let (at, reply) = match action {
            Action::Infer { id, earliest, latest, input, batch_size, .. } => {
                let start = (*earliest).max(self.now);
                if start > *latest {
                    (
                        start,
                        Reply::Error(ErrorResult {
                            id: *id,
                            status: ActionErrorCode::TooLate,
                            message: "received past latest".into(),
                        }),
                    )
                } else {
                    let duration = self.exec_for(*batch_size);
                    (
                        start + duration,
                        Reply::Infer(InferResult {
                            id: *id,
                            exec: ExecProfile {
                                start,
                                duration,
                                gpu_clock: self.gpu_clock,
                            },
                            output: input.clone(),
                        }),
                    )
                }
            }
            Action::LoadWeights { id, earliest, .. } => (
                (*earliest).max(self.now) + self.load_ns,
                Reply::LoadWeights(LoadWeightsResult { id: *id, duration: self.load_ns }),
            ),
            Action::EvictWeights { id, .. } => (
                self.now + self.evict_ns,
                Reply::EvictWeights(EvictWeightsResult { id: *id, duration: self.evict_ns }),
            ),
        };
        self.seq += 1;
        self.pending.push(Reverse(PendingReply {
            at,
            seq: self.seq,
            event: WorkerEvent::Reply(reply),
        }));
    }

    /// Memory and placement invariants that must hold at every cycle.
    fn assert_invariants(&self) {
        let models = self.core.models();
        for gpu in self.core.gpus() {
            assert!(
                gpu.used_pages(models) <= gpu.total_pages,
                "gpu {} pages over-committed",
                gpu.id
            );
            assert!(gpu.loading_count() <= 1, "gpu {} loads concurrently", gpu.id);
            for (model_id, inst) in gpu.instances.iter().enumerate() {
                assert!(
                    !(inst.loaded && inst.loading),
                    "model {model_id} on gpu {} both loaded and loading",
                    gpu.id
                );
            }
        }
    }

    pub fn infer_batch_sizes(&self) -> Vec<u32> {
        self.log
            .iter()
            .filter_map(|a| match a {
                Action::Infer { batch_size, .. } => Some(*batch_size),
                _ => None,
            })
            .collect()
    }

    pub fn count_loads(&self) -> usize {
        self.log.iter().filter(|a| matches!(a, Action::LoadWeights { .. })).count()
    }

    pub fn count_evicts(&self) -> usize {
        self.log.iter().filter(|a| matches!(a, Action::EvictWeights { .. })).count()
    }
}

/// A cluster of one worker with the given GPUs and identical-shape models.
pub fn cluster(
    gpu_pages: &[u32],
    models: &[(u32, Vec<u32>, Vec<u64>)],
) -> ClusterState {
    ClusterState {
        page_size: 16 * 1024 * 1024,
        workers: vec![WorkerState {
            id: 0,
            gpus: gpu_pages
                .iter()
                .enumerate()
                .map(|(i, &total_pages)| GpuSpec {
                    gpu_index: i,
                    total_pages,
                    default_clock: 1380,
                })
                .collect(),
        }],
        models: models
            .iter()
            .enumerate()
            .map(|(id, (pages, batch_sizes, exec_estimates))| BatchedModelState {
                id,
                name: format!("model-{id}"),
                num_weights_pages: *pages,
                batch_sizes: batch_sizes.clone(),
                exec_estimates: exec_estimates.clone(),
                weights_load_estimate: 8 * MS,
            })
            .collect(),
    }
}
