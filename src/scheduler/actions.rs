//! Outstanding actions and their dispatch windows.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::Action;
use crate::scheduler::request::Request;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic action id. Ids survive only within one controller
/// process; workers treat them as opaque.
pub fn next_action_id() -> u64 {
    NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A dispatched batched inference. Owns its requests until the terminal
/// result arrives.
pub struct InferAction {
    pub id: u64,
    pub model_id: usize,
    pub gpu_id: usize,
    pub batch_size: u32,
    /// Instance version the batch was scheduled against.
    pub version: u32,
    pub earliest: u64,
    pub latest: u64,
    pub expected_start: u64,
    pub expected_duration: u64,
    pub sent_at: u64,
    pub requests: Vec<Request>,
}

impl InferAction {
    /// Concatenate the constituent inputs in queue order.
    pub fn batch_input(&self) -> Vec<u8> {
        let total: usize = self.requests.iter().map(|r| r.input.len()).sum();
        let mut input = Vec::with_capacity(total);
        for r in &self.requests {
            input.extend_from_slice(&r.input);
        }
        input
    }

    /// Split a batched output evenly across the constituent requests.
    /// Returns None when the output does not divide evenly, which the
    /// caller treats as an internal error for every request.
    pub fn unbatch_output(&self, output: &[u8]) -> Option<Vec<Vec<u8>>> {
        let n = self.requests.len();
        if n == 0 || output.len() % n != 0 {
            return None;
        }
        let each = output.len() / n;
        Some(output.chunks(each).map(|c| c.to_vec()).collect())
    }

    pub fn to_wire(&self) -> Action {
        Action::Infer {
            id: self.id,
            gpu_id: self.gpu_id,
            model_id: self.model_id,
            batch_size: self.batch_size,
            earliest: self.earliest,
            latest: self.latest,
            input: self.batch_input(),
        }
    }
}

/// A dispatched weights transfer; completing it bumps the instance version.
pub struct LoadWeightsAction {
    pub id: u64,
    pub model_id: usize,
    pub gpu_id: usize,
    pub earliest: u64,
    pub latest: u64,
    /// Version the instance will carry once this load lands.
    pub version: u32,
    pub expected_duration: u64,
    pub sent_at: u64,
}

impl LoadWeightsAction {
    pub fn to_wire(&self) -> Action {
        Action::LoadWeights {
            id: self.id,
            gpu_id: self.gpu_id,
            model_id: self.model_id,
            earliest: self.earliest,
            latest: self.latest,
        }
    }
}

/// A dispatched page release. Pages are credited back when the worker
/// confirms, success or not.
pub struct EvictWeightsAction {
    pub id: u64,
    pub model_id: usize,
    pub gpu_id: usize,
    pub earliest: u64,
    pub latest: u64,
    pub sent_at: u64,
}

impl EvictWeightsAction {
    pub fn to_wire(&self) -> Action {
        Action::EvictWeights {
            id: self.id,
            gpu_id: self.gpu_id,
            model_id: self.model_id,
            earliest: self.earliest,
            latest: self.latest,
        }
    }
}

/// Registry entry: one completion continuation fires per id.
pub enum OutstandingAction {
    Infer(InferAction),
    Load(LoadWeightsAction),
    Evict(EvictWeightsAction),
}

impl OutstandingAction {
    pub fn id(&self) -> u64 {
        match self {
            Self::Infer(a) => a.id,
            Self::Load(a) => a.id,
            Self::Evict(a) => a.id,
        }
    }

    pub fn gpu_id(&self) -> usize {
        match self {
            Self::Infer(a) => a.gpu_id,
            Self::Load(a) => a.gpu_id,
            Self::Evict(a) => a.gpu_id,
        }
    }

    pub fn latest(&self) -> u64 {
        match self {
            Self::Infer(a) => a.latest,
            Self::Load(a) => a.latest,
            Self::Evict(a) => a.latest,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Infer(_) => "infer",
            Self::Load(_) => "load_weights",
            Self::Evict(_) => "evict_weights",
        }
    }
}
