//! Per-model scheduler state: request queue, batch ladder, estimates.

use std::collections::VecDeque;

use crate::api::BatchedModelState;
use crate::config::SchedulerConfig;
use crate::scheduler::estimator::SlidingWindowEstimator;
use crate::scheduler::request::Request;

/// One model known to the scheduler. Holds the FIFO of admitted requests,
/// the supported batch-size ladder, and the execution-time estimators that
/// drive every dispatch decision.
pub struct Model {
    pub id: usize,
    pub name: String,
    pub num_weights_pages: u32,
    supported_batch_sizes: Vec<u32>,
    /// `lookup[n]` is the largest supported batch size ≤ n.
    lookup: Vec<u32>,
    max_batch_size: u32,
    estimators: Vec<SlidingWindowEstimator>,
    /// Cached estimates, ns at the reference clock; parallel to the ladder.
    estimates: Vec<u64>,
    weights_estimator: SlidingWindowEstimator,
    weights_estimate: u64,
    default_clock: u32,
    queue: VecDeque<Request>,
}

impl Model {
    pub fn new(state: &BatchedModelState, cfg: &SchedulerConfig) -> Self {
        let max_batch_size = *state.batch_sizes.last().expect("validated ladder");
        let mut lookup = vec![0u32; max_batch_size as usize + 1];
        for n in 1..=max_batch_size {
            lookup[n as usize] = state
                .batch_sizes
                .iter()
                .copied()
                .filter(|&b| b <= n)
                .max()
                .unwrap_or(0);
        }

        let mut estimators = Vec::with_capacity(state.batch_sizes.len());
        let mut estimates = Vec::with_capacity(state.batch_sizes.len());
        for &initial in &state.exec_estimates {
            let mut est = SlidingWindowEstimator::new(cfg.estimate_window, cfg.estimate_percentile);
            est.insert(initial);
            estimates.push(initial);
            estimators.push(est);
        }
        let mut weights_estimator =
            SlidingWindowEstimator::new(cfg.estimate_window, cfg.estimate_percentile);
        weights_estimator.insert(state.weights_load_estimate);

        Self {
            id: state.id,
            name: state.name.clone(),
            num_weights_pages: state.num_weights_pages,
            supported_batch_sizes: state.batch_sizes.clone(),
            lookup,
            max_batch_size,
            estimators,
            estimates,
            weights_estimator,
            weights_estimate: state.weights_load_estimate,
            default_clock: cfg.default_clock,
            queue: VecDeque::new(),
        }
    }

    pub fn supported_batch_sizes(&self) -> &[u32] {
        &self.supported_batch_sizes
    }

    fn ladder_index(&self, batch_size: u32) -> Option<usize> {
        self.supported_batch_sizes.iter().position(|&b| b == batch_size)
    }

    /// Largest supported batch size we could execute for `n` queued
    /// requests, excluding sizes whose estimate exceeds the exec ceiling.
    /// Returns 0 when nothing is dispatchable (backpressure).
    pub fn batch_lookup(&self, n: u32, max_exec_ns: u64) -> u32 {
        let mut b = self.lookup[n.min(self.max_batch_size) as usize];
        while b > 0 && self.estimate(b) > max_exec_ns {
            b = self.next_smaller(b);
        }
        b
    }

    fn next_smaller(&self, batch_size: u32) -> u32 {
        self.supported_batch_sizes
            .iter()
            .copied()
            .filter(|&b| b < batch_size)
            .max()
            .unwrap_or(0)
    }

    /// Exec estimate for a batch size, ns at the reference clock.
    pub fn estimate(&self, batch_size: u32) -> u64 {
        match self.ladder_index(batch_size) {
            Some(i) => self.estimates[i],
            None => 0,
        }
    }

    /// Exec estimate scaled to a GPU's current memory clock.
    pub fn estimate_for_clock(&self, batch_size: u32, clock: u32) -> u64 {
        let est = self.estimate(batch_size);
        est * self.default_clock as u64 / clock.max(1) as u64
    }

    /// Feed back a measured execution, normalized to the reference clock.
    pub fn add_measurement(&mut self, batch_size: u32, duration: u64, clock: u32) {
        if let Some(i) = self.ladder_index(batch_size) {
            let normalized = duration * clock as u64 / self.default_clock as u64;
            self.estimators[i].insert(normalized);
            self.estimates[i] = self.estimators[i].estimate();
        }
    }

    pub fn estimate_weights(&self) -> u64 {
        self.weights_estimate
    }

    pub fn add_weights_measurement(&mut self, duration: u64) {
        self.weights_estimator.insert(duration);
        self.weights_estimate = self.weights_estimator.estimate();
    }

    /// Force-reset the estimate for one batch size (operator override used
    /// when an estimator has been poisoned by anomalous measurements).
    pub fn reset_estimate(&mut self, batch_size: u32, value: u64, cfg: &SchedulerConfig) {
        if let Some(i) = self.ladder_index(batch_size) {
            self.estimators[i] =
                SlidingWindowEstimator::new(cfg.estimate_window, cfg.estimate_percentile);
            self.estimators[i].insert(value);
            self.estimates[i] = value;
        }
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// (id, deadline) of every queued request, for strategy generation.
    pub fn queued_meta(&self) -> Vec<(u64, u64)> {
        self.queue.iter().map(|r| (r.id, r.deadline)).collect()
    }

    /// Drop requests from the front whose deadline can no longer be met even
    /// at batch size 1. Returned requests still owe a terminal callback and
    /// a demand credit; the caller finalizes them.
    pub fn check_timeouts(&mut self, free_at: u64, clock: u32, cfg: &SchedulerConfig) -> Vec<Request> {
        let unit = self.estimate_for_clock(1, clock);
        let mut dropped = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.deadline < free_at + unit + cfg.buffer_ns {
                dropped.push(self.queue.pop_front().expect("front checked"));
            } else {
                break;
            }
        }
        dropped
    }

    /// Remove every queued request whose deadline has already passed,
    /// wherever it sits in the queue. Backstop for requests that no longer
    /// have live strategies (unloaded model, over-budget estimates).
    pub fn expire_before(&mut self, now: u64) -> Vec<Request> {
        if self.queue.iter().all(|r| r.deadline > now) {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for r in self.queue.drain(..) {
            if r.deadline <= now {
                expired.push(r);
            } else {
                kept.push_back(r);
            }
        }
        self.queue = kept;
        expired
    }

    /// Assemble the largest deadline-feasible batch up to the strategy's
    /// size. The caller must have run `check_timeouts` for this `free_at`
    /// first. Returns the dequeued requests plus the batch size used.
    pub fn try_dequeue(
        &mut self,
        free_at: u64,
        clock: u32,
        strategy_batch: u32,
        cfg: &SchedulerConfig,
    ) -> Option<(Vec<Request>, u32)> {
        let n = self.queue.len() as u32;
        if n == 0 {
            return None;
        }
        let mut b = self.batch_lookup(n.min(strategy_batch.max(1)), cfg.max_exec_ns);
        while b > 0 {
            let take = b as usize;
            let earliest_deadline = self
                .queue
                .iter()
                .take(take)
                .map(|r| r.deadline)
                .min()
                .expect("non-empty queue");
            if free_at + self.estimate_for_clock(b, clock) + cfg.buffer_ns <= earliest_deadline {
                let mut batch = Vec::with_capacity(take);
                for _ in 0..take {
                    let mut r = self.queue.pop_front().expect("sized above");
                    r.executing = true;
                    batch.push(r);
                }
                return Some((batch, b));
            }
            b = self.next_smaller(b);
        }
        None
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
