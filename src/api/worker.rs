//! Worker-facing action protocol.
//!
//! The controller issues three kinds of actions; each carries an
//! `[earliest, latest]` dispatch window. A worker that receives an action
//! after `latest` must reply with an error rather than execute it.

use serde::{Deserialize, Serialize};

/// An action dispatched to a worker GPU. Ids are assigned by the controller
/// and are unique for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Action {
    Infer {
        id: u64,
        gpu_id: usize,
        model_id: usize,
        batch_size: u32,
        earliest: u64,
        latest: u64,
        input: Vec<u8>,
    },
    LoadWeights {
        id: u64,
        gpu_id: usize,
        model_id: usize,
        earliest: u64,
        latest: u64,
    },
    EvictWeights {
        id: u64,
        gpu_id: usize,
        model_id: usize,
        earliest: u64,
        latest: u64,
    },
}

impl Action {
    pub fn id(&self) -> u64 {
        match self {
            Self::Infer { id, .. }
            | Self::LoadWeights { id, .. }
            | Self::EvictWeights { id, .. } => *id,
        }
    }

    pub fn gpu_id(&self) -> usize {
        match self {
            Self::Infer { gpu_id, .. }
            | Self::LoadWeights { gpu_id, .. }
            | Self::EvictWeights { gpu_id, .. } => *gpu_id,
        }
    }
}

/// Timing observed by the worker while executing an Infer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExecProfile {
    pub start: u64,
    pub duration: u64,
    pub gpu_clock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferResult {
    pub id: u64,
    pub exec: ExecProfile,
    pub output: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadWeightsResult {
    pub id: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EvictWeightsResult {
    pub id: u64,
    pub duration: u64,
}

/// Why a worker rejected or failed an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionErrorCode {
    /// Received after its `latest` instant.
    TooLate,
    /// Worker declined due to overload.
    Overloaded,
    /// Kernel or transfer failure during execution.
    ExecutionFailed,
    /// Insufficient GPU pages at execution time.
    OutOfMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    pub id: u64,
    pub status: ActionErrorCode,
    pub message: String,
}

/// A worker's reply to a previously issued action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    Infer(InferResult),
    LoadWeights(LoadWeightsResult),
    EvictWeights(EvictWeightsResult),
    Error(ErrorResult),
}

impl Reply {
    pub fn id(&self) -> u64 {
        match self {
            Self::Infer(r) => r.id,
            Self::LoadWeights(r) => r.id,
            Self::EvictWeights(r) => r.id,
            Self::Error(r) => r.id,
        }
    }
}

/// Everything the worker-network threads can feed back to the scheduler.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Reply(Reply),
    Disconnected { worker_id: usize },
}

/// Outbound half of a worker connection.
///
/// Implementations enqueue the action for transmission and return
/// immediately; the scheduler thread must never block on network I/O.
pub trait WorkerConnection: Send {
    fn worker_id(&self) -> usize;
    fn send(&self, action: Action);
}
