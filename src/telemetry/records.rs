//! Telemetry record shapes and their TSV encodings.

/// One row of the per-action log.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    /// Controller timestamp at completion.
    pub t: u64,
    pub action_id: u64,
    pub action_type: &'static str,
    pub status: &'static str,
    pub worker_id: usize,
    pub gpu_id: usize,
    pub model_id: usize,
    pub batch_size: u32,
    /// Dispatch-to-result time observed by the controller.
    pub controller_action_duration_ns: u64,
    /// Execution time reported by the worker (0 on error).
    pub worker_exec_duration_ns: u64,
}

impl ActionRecord {
    pub const HEADER: &'static str = "t\taction_id\taction_type\tstatus\tworker_id\tgpu_id\tmodel_id\tbatch_size\tcontroller_action_duration_ns\tworker_exec_duration_ns";

    pub fn tsv_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.t,
            self.action_id,
            self.action_type,
            self.status,
            self.worker_id,
            self.gpu_id,
            self.model_id,
            self.batch_size,
            self.controller_action_duration_ns,
            self.worker_exec_duration_ns,
        )
    }
}

/// One row of the per-request log.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    /// Controller timestamp at departure.
    pub t: u64,
    pub request_id: u64,
    pub result: &'static str,
    pub user_id: u32,
    pub model_id: usize,
    pub latency_ns: u64,
    /// True only for responses delivered within their deadline.
    pub goodput: bool,
}

impl RequestRecord {
    pub const HEADER: &'static str = "t\trequest_id\tresult\tuser_id\tmodel_id\tlatency_ns";

    pub fn tsv_row(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.t, self.request_id, self.result, self.user_id, self.model_id, self.latency_ns,
        )
    }
}
