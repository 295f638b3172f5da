//! Logical wire messages exchanged with clients and workers.
//!
//! Transports are external collaborators; these types define the message
//! shapes they carry and the bootstrap state handed to the controller.

pub mod client;
pub mod state;
pub mod worker;

pub use client::{
    response_channel, InferCallback, InferStatus, InferenceRequest, InferenceResponse, ResponseRx,
};
pub use state::{BatchedModelState, ClusterState, GpuSpec, StateError, WorkerState};
pub use worker::{
    Action, ActionErrorCode, ErrorResult, EvictWeightsResult, ExecProfile, InferResult,
    LoadWeightsResult, Reply, WorkerConnection, WorkerEvent,
};
