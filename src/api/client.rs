//! Client-facing inference protocol.

use serde::{Deserialize, Serialize};

/// A single inference request as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub user_id: u32,
    pub model_id: usize,
    /// Relative SLO; the absolute deadline is arrival + slo.
    pub slo_ns: u64,
    pub input: Vec<u8>,
}

/// Terminal outcome of an inference request. Failures with no dedicated
/// client-facing status (worker loss, lost results, malformed outputs)
/// surface as `InternalError`; the action log records the finer cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferStatus {
    Success,
    DeadlineExceeded,
    ModelNotFound,
    InternalError,
}

impl std::fmt::Display for InferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::ModelNotFound => "model-not-found",
            Self::InternalError => "internal-error",
        };
        write!(f, "{s}")
    }
}

/// The response delivered to the client's callback, exactly once per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub status: InferStatus,
    pub output: Vec<u8>,
    /// Controller timestamp at which the outcome was decided.
    pub departure: u64,
}

impl InferenceResponse {
    pub fn error(status: InferStatus, departure: u64) -> Self {
        Self { status, output: Vec::new(), departure }
    }
}

/// Completion continuation for one request. Network threads hand one of
/// these in with every submission; the scheduler invokes it exactly once.
pub type InferCallback = Box<dyn FnOnce(InferenceResponse) + Send + 'static>;

/// Receiver half for awaiting an inference outcome.
pub type ResponseRx = tokio::sync::oneshot::Receiver<InferenceResponse>;

/// Bridge a callback onto a oneshot channel for async callers.
pub fn response_channel() -> (InferCallback, ResponseRx) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let callback: InferCallback = Box::new(move |response| {
        // The caller may have dropped the receiver; that is their choice.
        let _ = tx.send(response);
    });
    (callback, rx)
}
