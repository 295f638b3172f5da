//! Bootstrap state describing the worker fleet.
//!
//! Delivered once at startup; the scheduler validates it and builds its
//! model and GPU arenas from it. Ids are dense indices: model `i` is
//! `models[i]`, and GPUs are numbered in worker order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::PageMappedModelDef;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("model {0} has no supported batch sizes")]
    NoBatchSizes(usize),

    #[error("model {0} batch sizes are not strictly ascending")]
    BatchSizesNotAscending(usize),

    #[error("model {0} batch ladder must start at batch size 1")]
    NoUnitBatchSize(usize),

    #[error("model {model_id} has {got} exec estimates for {want} batch sizes")]
    EstimateCountMismatch { model_id: usize, got: usize, want: usize },

    #[error("model {0} has zero weights pages")]
    ZeroWeightsPages(usize),

    #[error("model ids are not dense: expected {expected}, found {found}")]
    NonDenseModelIds { expected: usize, found: usize },

    #[error("worker {worker_id} gpu {gpu_index} has zero pages")]
    ZeroGpuPages { worker_id: usize, gpu_index: usize },

    #[error("worker ids are not dense: expected {expected}, found {found}")]
    NonDenseWorkerIds { expected: usize, found: usize },

    #[error("cluster has no GPUs")]
    NoGpus,

    #[error("cluster has no models")]
    NoModels,
}

/// One GPU on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSpec {
    /// Index of this GPU on its worker.
    pub gpu_index: usize,
    pub total_pages: u32,
    /// Memory clock the exec estimates were measured at.
    pub default_clock: u32,
}

/// One worker node and its GPUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: usize,
    pub gpus: Vec<GpuSpec>,
}

/// A batched model available on every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchedModelState {
    pub id: usize,
    /// Client-visible name (artifact path stem).
    pub name: String,
    pub num_weights_pages: u32,
    /// Supported batch sizes, strictly ascending.
    pub batch_sizes: Vec<u32>,
    /// Initial exec-time estimate per batch size, ns at `default_clock`.
    pub exec_estimates: Vec<u64>,
    /// Initial weights-load-time estimate, ns.
    pub weights_load_estimate: u64,
}

impl BatchedModelState {
    /// Derive bootstrap state from a compiled artifact. Exec estimates come
    /// from the profiling data shipped alongside the artifact.
    pub fn from_artifact(
        id: usize,
        name: impl Into<String>,
        def: &PageMappedModelDef,
        batch_sizes: Vec<u32>,
        exec_estimates: Vec<u64>,
        weights_load_estimate: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            num_weights_pages: def.weights_pages.len() as u32,
            batch_sizes,
            exec_estimates,
            weights_load_estimate,
        }
    }
}

/// Everything the controller needs to know about the fleet at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    /// GPU page size in bytes; constant across the deployment.
    pub page_size: u64,
    pub workers: Vec<WorkerState>,
    pub models: Vec<BatchedModelState>,
}

impl ClusterState {
    /// Validate the structural invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), StateError> {
        if self.models.is_empty() {
            return Err(StateError::NoModels);
        }
        let gpu_count: usize = self.workers.iter().map(|w| w.gpus.len()).sum();
        if gpu_count == 0 {
            return Err(StateError::NoGpus);
        }
        for (expected, worker) in self.workers.iter().enumerate() {
            if worker.id != expected {
                return Err(StateError::NonDenseWorkerIds { expected, found: worker.id });
            }
            for gpu in &worker.gpus {
                if gpu.total_pages == 0 {
                    return Err(StateError::ZeroGpuPages {
                        worker_id: worker.id,
                        gpu_index: gpu.gpu_index,
                    });
                }
            }
        }
        for (expected, model) in self.models.iter().enumerate() {
            if model.id != expected {
                return Err(StateError::NonDenseModelIds { expected, found: model.id });
            }
            if model.batch_sizes.is_empty() {
                return Err(StateError::NoBatchSizes(model.id));
            }
            // Batching math (timeout thresholds, demand sizing, the shrink
            // loop) is anchored on a batch-1 estimate.
            if model.batch_sizes[0] != 1 {
                return Err(StateError::NoUnitBatchSize(model.id));
            }
            if !model.batch_sizes.windows(2).all(|w| w[0] < w[1]) {
                return Err(StateError::BatchSizesNotAscending(model.id));
            }
            if model.exec_estimates.len() != model.batch_sizes.len() {
                return Err(StateError::EstimateCountMismatch {
                    model_id: model.id,
                    got: model.exec_estimates.len(),
                    want: model.batch_sizes.len(),
                });
            }
            if model.num_weights_pages == 0 {
                return Err(StateError::ZeroWeightsPages(model.id));
            }
        }
        Ok(())
    }

    /// Total number of GPUs across all workers.
    pub fn gpu_count(&self) -> usize {
        self.workers.iter().map(|w| w.gpus.len()).sum()
    }
}
