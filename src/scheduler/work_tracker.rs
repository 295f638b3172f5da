//! Global demand and capacity accounting.
//!
//! Tracks outstanding work per model (in nanoseconds of execution time at
//! the reference clock) against per-GPU capacity, and advises which model a
//! GPU should load next and which resident it should evict when pages run
//! short.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

/// Work owed on behalf of one admitted request. Issued by `add_request`,
/// surrendered exactly once through `request_completed`.
#[derive(Debug, Clone, Copy)]
pub struct Demand {
    pub model_id: usize,
    pub size: i64,
}

/// Placement rank of one model on one GPU.
#[derive(Debug, Clone, Copy)]
struct Priority {
    value: i64,
    is_empty: bool,
}

impl Default for Priority {
    fn default() -> Self {
        Self { value: 0, is_empty: true }
    }
}

struct ModelEntry {
    outstanding: i64,
    completed: i64,
    gpus: Vec<bool>,
    loading: Vec<bool>,
    allocations: Vec<i64>,
    priorities: Vec<Priority>,
    gpu_count: usize,
    seqno: u64,
    /// Tie-breaking hint: the GPU this model was last chosen for.
    preference: usize,
}

impl ModelEntry {
    fn placed_on(&self, gpu_id: usize) -> bool {
        self.gpus[gpu_id] || self.loading[gpu_id]
    }
}

struct GpuEntry {
    outstanding: i64,
    model_count: usize,
}

/// Demand queued for a model hosted nowhere; it expires once its SLO window
/// has passed unserved.
struct PendingDemand {
    model_id: usize,
    size: i64,
    expires: u64,
}

impl PartialEq for PendingDemand {
    fn eq(&self, other: &Self) -> bool {
        self.expires == other.expires
    }
}
impl Eq for PendingDemand {}
impl PartialOrd for PendingDemand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingDemand {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on expiry.
        other.expires.cmp(&self.expires)
    }
}

struct TrackerState {
    models: Vec<ModelEntry>,
    gpus: Vec<GpuEntry>,
    pending: BinaryHeap<PendingDemand>,
    seqno_seed: u64,
}

/// Ranking used both to pick load candidates (best first) and eviction
/// victims (worst first): a non-empty entry always outranks an empty one;
/// non-empty entries rank by priority value; empty entries rank by how
/// recently their model was touched.
fn rank(a: (Priority, u64), b: (Priority, u64)) -> Ordering {
    let ((ap, aseq), (bp, bseq)) = (a, b);
    match (ap.is_empty, bp.is_empty) {
        (true, true) => aseq.cmp(&bseq),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => ap.value.cmp(&bp.value).then(aseq.cmp(&bseq)),
    }
}

/// Baseline work every GPU is assumed to carry, ns.
const GPU_OUTSTANDING_FLOOR: i64 = 1_000_000;

/// Demand/capacity balancer consulted by the scheduler's event handlers.
///
/// A single lock serializes all mutations; callers never hold it across
/// blocking calls, so uncontended acquisition stays cache-hot.
pub struct WorkTracker {
    state: Mutex<TrackerState>,
    /// Per-GPU work capacity per SLO window, ns.
    capacity: i64,
}

impl WorkTracker {
    pub fn new(n_gpus: usize, n_models: usize, capacity_ns: u64) -> Self {
        let models = (0..n_models)
            .map(|_| ModelEntry {
                outstanding: 0,
                completed: 0,
                gpus: vec![false; n_gpus],
                loading: vec![false; n_gpus],
                allocations: vec![0; n_gpus],
                priorities: vec![Priority::default(); n_gpus],
                gpu_count: 0,
                seqno: 0,
                preference: 0,
            })
            .collect();
        let gpus = (0..n_gpus)
            .map(|_| GpuEntry { outstanding: GPU_OUTSTANDING_FLOOR, model_count: 0 })
            .collect();
        Self {
            state: Mutex::new(TrackerState {
                models,
                gpus,
                pending: BinaryHeap::new(),
                seqno_seed: 0,
            }),
            capacity: capacity_ns as i64,
        }
    }

    /// Minimum outstanding work before a model is worth loading. Loads that
    /// force an eviction need twice the demand to pay for themselves.
    fn load_threshold(&self, requires_eviction: bool) -> i64 {
        let base = self.capacity / 100;
        if requires_eviction {
            base * 2
        } else {
            base
        }
    }

    /// Charge `size` ns of work to a model. Demand for a hosted model is
    /// split across its GPUs immediately; demand for an unhosted model waits
    /// for a placement until its SLO window expires.
    pub fn add_request(&self, model_id: usize, size: i64, slo_ns: u64, now: u64) -> Demand {
        let mut s = self.state.lock();
        expire_pending(&mut s, now);
        s.seqno_seed += 1;
        let seqno = s.seqno_seed;
        let m = &mut s.models[model_id];
        m.outstanding += size;
        m.seqno = seqno;
        if m.gpu_count == 0 {
            s.pending.push(PendingDemand { model_id, size, expires: now + slo_ns });
        }
        distribute(&mut s, model_id);
        update_priorities(&mut s, model_id);
        Demand { model_id, size }
    }

    /// Surrender a demand handle: the work is no longer outstanding, whether
    /// it completed, missed its deadline, or was dropped.
    pub fn request_completed(&self, demand: Demand) {
        let mut s = self.state.lock();
        let m = &mut s.models[demand.model_id];
        m.outstanding = (m.outstanding - demand.size).max(0);
        m.completed += demand.size;
        distribute(&mut s, demand.model_id);
        update_priorities(&mut s, demand.model_id);
    }

    /// Pick the best model to load onto `gpu_id`, committing it to the
    /// loading state. Returns None when no model's demand justifies a load.
    pub fn load_model(&self, gpu_id: usize, requires_eviction: bool, now: u64) -> Option<usize> {
        let threshold = self.load_threshold(requires_eviction);
        let mut s = self.state.lock();
        expire_pending(&mut s, now);
        let best = s
            .models
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.placed_on(gpu_id) && m.outstanding > threshold)
            .max_by(|(_, a), (_, b)| {
                rank((a.priorities[gpu_id], a.seqno), (b.priorities[gpu_id], b.seqno))
            })
            .map(|(id, _)| id)?;

        s.seqno_seed += 1;
        let seqno = s.seqno_seed;
        let m = &mut s.models[best];
        m.loading[gpu_id] = true;
        m.gpu_count += 1;
        m.seqno = seqno;
        m.preference = gpu_id;
        s.gpus[gpu_id].model_count += 1;
        distribute(&mut s, best);
        update_priorities(&mut s, best);
        metrics::counter!("cadence_tracker_load_decisions").increment(1);
        Some(best)
    }

    /// Resolve a load previously committed by `load_model`.
    pub fn load_model_complete(&self, gpu_id: usize, model_id: usize, success: bool) {
        let mut s = self.state.lock();
        let m = &mut s.models[model_id];
        m.loading[gpu_id] = false;
        if success {
            m.gpus[gpu_id] = true;
        } else {
            m.gpu_count = m.gpu_count.saturating_sub(1);
            s.gpus[gpu_id].model_count = s.gpus[gpu_id].model_count.saturating_sub(1);
        }
        distribute(&mut s, model_id);
        update_priorities(&mut s, model_id);
    }

    /// Pick the eviction victim on `gpu_id` and remove the placement from
    /// the accounting. Idle residents go first (least recently touched),
    /// then the lowest-priority active resident. Models mid-load on this GPU
    /// are never victims. Freed pages are credited by the caller once the
    /// worker confirms the eviction.
    pub fn evict_model(&self, gpu_id: usize) -> Option<usize> {
        let mut s = self.state.lock();
        let victim = s
            .models
            .iter()
            .enumerate()
            .filter(|(_, m)| m.gpus[gpu_id] && !m.loading[gpu_id])
            .min_by(|(_, a), (_, b)| {
                rank((a.priorities[gpu_id], a.seqno), (b.priorities[gpu_id], b.seqno))
            })
            .map(|(id, _)| id)?;

        let m = &mut s.models[victim];
        m.gpus[gpu_id] = false;
        m.gpu_count = m.gpu_count.saturating_sub(1);
        s.gpus[gpu_id].model_count = s.gpus[gpu_id].model_count.saturating_sub(1);
        distribute(&mut s, victim);
        update_priorities(&mut s, victim);
        metrics::counter!("cadence_tracker_evict_decisions").increment(1);
        Some(victim)
    }

    /// Drop every placement on `gpu_id` (worker disconnect).
    pub fn drop_gpu(&self, gpu_id: usize) {
        let mut s = self.state.lock();
        for model_id in 0..s.models.len() {
            let m = &mut s.models[model_id];
            if m.placed_on(gpu_id) {
                m.gpus[gpu_id] = false;
                m.loading[gpu_id] = false;
                m.gpu_count = m.gpu_count.saturating_sub(1);
                s.gpus[gpu_id].model_count = s.gpus[gpu_id].model_count.saturating_sub(1);
                distribute(&mut s, model_id);
                update_priorities(&mut s, model_id);
            }
        }
    }

    // Read-only views for the dispatch loop and tests.

    pub fn outstanding(&self, model_id: usize) -> i64 {
        self.state.lock().models[model_id].outstanding
    }

    pub fn gpu_outstanding(&self, gpu_id: usize) -> i64 {
        self.state.lock().gpus[gpu_id].outstanding
    }

    pub fn gpu_model_count(&self, gpu_id: usize) -> usize {
        self.state.lock().gpus[gpu_id].model_count
    }

    pub fn allocation(&self, model_id: usize, gpu_id: usize) -> i64 {
        self.state.lock().models[model_id].allocations[gpu_id]
    }

    pub fn hosted_on(&self, model_id: usize, gpu_id: usize) -> bool {
        self.state.lock().models[model_id].gpus[gpu_id]
    }
}

/// Re-split a model's outstanding work across the GPUs that host it (or are
/// loading it). Maintains `sum(allocations) == outstanding` exactly for
/// placed models, and keeps each GPU's aggregate in sync.
fn distribute(s: &mut TrackerState, model_id: usize) {
    let TrackerState { models, gpus, .. } = s;
    let m = &mut models[model_id];
    let n_gpus = gpus.len();
    let targets: Vec<usize> = (0..n_gpus).filter(|&g| m.gpus[g] || m.loading[g]).collect();

    let mut new_allocations = vec![0i64; n_gpus];
    if !targets.is_empty() {
        let share = m.outstanding / targets.len() as i64;
        let remainder = m.outstanding - share * targets.len() as i64;
        for (i, &g) in targets.iter().enumerate() {
            new_allocations[g] = share + i64::from((i as i64) < remainder);
        }
    }

    for (g, gpu) in gpus.iter_mut().enumerate() {
        let delta = new_allocations[g] - m.allocations[g];
        m.allocations[g] = new_allocations[g];
        gpu.outstanding += delta;
    }

    debug_assert!(
        targets.is_empty() || m.allocations.iter().sum::<i64>() == m.outstanding
    );
}

fn update_priorities(s: &mut TrackerState, model_id: usize) {
    let n_gpus = s.gpus.len();
    let m = &mut s.models[model_id];
    for g in 0..n_gpus {
        m.priorities[g] = if m.gpus[g] || m.loading[g] {
            Priority {
                value: m.allocations[g] - m.completed / m.gpu_count.max(1) as i64,
                is_empty: m.allocations[g] == 0,
            }
        } else {
            // The allocation this GPU would receive is the model's whole
            // undistributed outstanding.
            Priority {
                value: m.outstanding - m.completed / (m.gpu_count + 1) as i64,
                is_empty: m.outstanding == 0,
            }
        };
    }
}

/// Retire queued demand whose SLO window passed while the model was hosted
/// nowhere; those requests have already timed out client-side.
fn expire_pending(s: &mut TrackerState, now: u64) {
    let mut touched = Vec::new();
    {
        let TrackerState { models, pending, .. } = s;
        while let Some(top) = pending.peek() {
            if top.expires > now {
                break;
            }
            let e = pending.pop().expect("peeked entry");
            let m = &mut models[e.model_id];
            if m.gpu_count == 0 && m.outstanding > 0 {
                m.outstanding = (m.outstanding - e.size).max(0);
                touched.push(e.model_id);
            }
        }
    }
    for model_id in touched {
        update_priorities(s, model_id);
    }
}

#[cfg(test)]
#[path = "work_tracker_tests.rs"]
mod tests;
