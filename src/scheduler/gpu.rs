//! Per-GPU dispatch: strategy consumption, loading, and eviction.

use std::collections::VecDeque;

use crate::config::SchedulerConfig;
use crate::scheduler::actions::{
    next_action_id, EvictWeightsAction, InferAction, LoadWeightsAction, OutstandingAction,
};
use crate::scheduler::model::Model;
use crate::scheduler::request::Request;
use crate::scheduler::strategy::{InferStrategy, StrategyQueue};
use crate::scheduler::tracker::WorkerTracker;
use crate::scheduler::work_tracker::WorkTracker;

/// Placement of one model on this GPU.
///
/// At most one of `loaded`/`loading` is true; `version` increments on every
/// completed load, and actions built against an older version are discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Instance {
    pub loaded: bool,
    pub loading: bool,
    pub version: u32,
}

/// A weights transfer in flight.
#[derive(Debug, Clone, Copy)]
pub struct PendingLoad {
    pub model_id: usize,
    pub version: u32,
    pub available_at: u64,
}

/// Everything `check_pending`/`try_load` decided this cycle: actions to
/// dispatch plus requests that ran out of time at the head of a queue.
#[derive(Default)]
pub struct DispatchOutcome {
    pub actions: Vec<OutstandingAction>,
    pub timed_out: Vec<Request>,
}

/// One worker GPU as the scheduler sees it.
pub struct Gpu {
    /// Dense cluster-wide id.
    pub id: usize,
    pub worker_id: usize,
    /// Index of this GPU on its worker.
    pub gpu_index: usize,
    pub exec: WorkerTracker,
    pub loadweights: WorkerTracker,
    pub total_pages: u32,
    pub free_pages: u32,
    /// Most recently observed memory clock.
    pub clock: u32,
    pub alive: bool,
    pub instances: Vec<Instance>,
    pub pending_loads: VecDeque<PendingLoad>,
    pub strategies: StrategyQueue,
    /// Pages owed back by in-flight evictions.
    pub pending_evict_pages: u32,
    /// Smallest weights footprint across all models; below this, a load
    /// cannot happen without eviction.
    min_model_pages: u32,
}

impl Gpu {
    pub fn new(
        id: usize,
        worker_id: usize,
        gpu_index: usize,
        total_pages: u32,
        clock: u32,
        n_models: usize,
        min_model_pages: u32,
    ) -> Self {
        Self {
            id,
            worker_id,
            gpu_index,
            exec: WorkerTracker::new(),
            loadweights: WorkerTracker::new(),
            total_pages,
            free_pages: total_pages,
            clock,
            alive: true,
            instances: vec![Instance::default(); n_models],
            pending_loads: VecDeque::new(),
            strategies: StrategyQueue::new(),
            pending_evict_pages: 0,
            min_model_pages,
        }
    }

    /// Plan entries for one newly arrived request on a resident instance.
    pub fn push_request_strategies(
        &mut self,
        model: &Model,
        request_id: u64,
        deadline: u64,
        cfg: &SchedulerConfig,
    ) {
        let inst = self.instances[model.id];
        if !self.alive || !inst.loaded {
            return;
        }
        let free_at = self.exec.available_at();
        for &b in model.supported_batch_sizes() {
            let est = model.estimate_for_clock(b, self.clock);
            let priority = deadline.saturating_sub(cfg.buffer_ns + est).max(free_at);
            self.strategies.push(InferStrategy {
                priority,
                deadline,
                request_id,
                batch_size: b,
                version: inst.version,
                model_id: model.id,
            });
        }
    }

    /// Plan entries for everything queued on a model (after a load lands or
    /// an action completes).
    pub fn push_queue_strategies(&mut self, model: &Model, cfg: &SchedulerConfig) {
        for (request_id, deadline) in model.queued_meta() {
            self.push_request_strategies(model, request_id, deadline, cfg);
        }
    }

    /// Consume eligible strategies into concrete Infer actions.
    ///
    /// Runs until the best remaining plan is further out than the dispatch
    /// lookahead. Stale plans (version mismatch, unloaded instance) are
    /// discarded; feasible ones reserve exec time and become actions.
    pub fn check_pending(
        &mut self,
        models: &mut [Model],
        cfg: &SchedulerConfig,
        now: u64,
    ) -> DispatchOutcome {
        let mut out = DispatchOutcome::default();
        if !self.alive {
            return out;
        }
        while let Some(top) = self.strategies.peek().copied() {
            if top.priority > now + cfg.schedule_ahead_ns {
                break;
            }
            let s = self.strategies.pop().expect("peeked entry");
            let inst = self.instances[s.model_id];
            if !inst.loaded || inst.version != s.version {
                continue;
            }
            let model = &mut models[s.model_id];
            let free_at = self.exec.available_at().max(now);
            out.timed_out.extend(model.check_timeouts(free_at, self.clock, cfg));

            let Some((requests, batch_size)) =
                model.try_dequeue(free_at, self.clock, s.batch_size, cfg)
            else {
                continue;
            };
            let duration = model.estimate_for_clock(batch_size, self.clock);
            let start = self.exec.schedule(duration, now);
            let oldest_deadline = requests
                .iter()
                .map(|r| r.deadline)
                .min()
                .expect("non-empty batch");
            let latest = oldest_deadline
                .saturating_sub(cfg.buffer_ns)
                .min(start + cfg.latest_delta_ns);
            out.actions.push(OutstandingAction::Infer(InferAction {
                id: next_action_id(),
                model_id: s.model_id,
                gpu_id: self.id,
                batch_size,
                version: s.version,
                earliest: start,
                latest,
                expected_start: start,
                expected_duration: duration,
                sent_at: now,
                requests,
            }));
        }
        out
    }

    /// Ask the work tracker for a load candidate and turn it into actions.
    ///
    /// At most one load is in flight per GPU. When pages are short, the
    /// eviction actions are issued first and the load attempt is rolled
    /// back; once the evictions confirm and pages return, a later cycle
    /// schedules the load cleanly.
    pub fn try_load(
        &mut self,
        models: &[Model],
        tracker: &WorkTracker,
        cfg: &SchedulerConfig,
        now: u64,
    ) -> Vec<OutstandingAction> {
        if !self.alive
            || self.instances.iter().any(|i| i.loading)
            || self.pending_evict_pages > 0
            || self.loadweights.available_at() > now + cfg.schedule_ahead_ns
        {
            return Vec::new();
        }
        let requires_eviction = self.free_pages < self.min_model_pages;
        let Some(candidate) = tracker.load_model(self.id, requires_eviction, now) else {
            return Vec::new();
        };
        let pages = models[candidate].num_weights_pages;

        if self.free_pages < pages {
            let actions = self.evict_pages(pages - self.free_pages, models, tracker, cfg, now);
            tracker.load_model_complete(self.id, candidate, false);
            return actions;
        }

        self.free_pages -= pages;
        let inst = &mut self.instances[candidate];
        inst.loading = true;
        let version = inst.version + 1;
        let duration = models[candidate].estimate_weights();
        let start = self.loadweights.schedule(duration, now);
        self.pending_loads.push_back(PendingLoad {
            model_id: candidate,
            version,
            available_at: self.loadweights.available_at(),
        });
        vec![OutstandingAction::Load(LoadWeightsAction {
            id: next_action_id(),
            model_id: candidate,
            gpu_id: self.id,
            earliest: start,
            latest: start + cfg.schedule_ahead_ns,
            version,
            expected_duration: duration,
            sent_at: now,
        })]
    }

    /// Issue evictions until `required` pages are on their way back.
    /// Victims stop serving immediately; their pages return when the worker
    /// confirms.
    fn evict_pages(
        &mut self,
        required: u32,
        models: &[Model],
        tracker: &WorkTracker,
        cfg: &SchedulerConfig,
        now: u64,
    ) -> Vec<OutstandingAction> {
        let mut actions = Vec::new();
        let mut remaining = required;
        while remaining > 0 {
            let Some(victim) = tracker.evict_model(self.id) else {
                break;
            };
            let inst = &mut self.instances[victim];
            debug_assert!(inst.loaded, "tracker evicted a non-resident model");
            inst.loaded = false;
            // Pages credited on EvictWeightsResult, not here.
            let pages = models[victim].num_weights_pages;
            self.pending_evict_pages += pages;
            remaining = remaining.saturating_sub(pages);
            actions.push(OutstandingAction::Evict(EvictWeightsAction {
                id: next_action_id(),
                model_id: victim,
                gpu_id: self.id,
                earliest: now,
                latest: now + cfg.schedule_ahead_ns,
                sent_at: now,
            }));
        }
        actions
    }

    /// A weights transfer confirmed: the instance becomes the new version.
    pub fn load_success(&mut self, action: &LoadWeightsAction) {
        let inst = &mut self.instances[action.model_id];
        inst.version = action.version;
        inst.loaded = true;
        inst.loading = false;
        self.retire_pending_load(action.model_id);
    }

    /// A weights transfer failed: restore the reserved pages.
    pub fn load_failed(&mut self, action: &LoadWeightsAction, pages: u32) {
        let inst = &mut self.instances[action.model_id];
        inst.loading = false;
        self.free_pages = (self.free_pages + pages).min(self.total_pages);
        self.retire_pending_load(action.model_id);
    }

    /// An eviction confirmed (success or error): pages come back.
    pub fn evict_complete(&mut self, action: &EvictWeightsAction, pages: u32) {
        self.instances[action.model_id].loaded = false;
        self.pending_evict_pages = self.pending_evict_pages.saturating_sub(pages);
        self.free_pages = (self.free_pages + pages).min(self.total_pages);
    }

    fn retire_pending_load(&mut self, model_id: usize) {
        if let Some(pos) = self.pending_loads.iter().position(|p| p.model_id == model_id) {
            self.pending_loads.remove(pos);
        }
    }

    /// Zero all scheduler state for this GPU (worker disconnect).
    pub fn disconnect(&mut self) {
        self.alive = false;
        for inst in &mut self.instances {
            inst.loaded = false;
            inst.loading = false;
        }
        self.free_pages = self.total_pages;
        self.pending_loads.clear();
        self.pending_evict_pages = 0;
        self.strategies.clear();
        self.exec.reset();
        self.loadweights.reset();
    }

    /// Pages held by resident instances plus transfers in flight; never
    /// exceeds the GPU's total.
    pub fn used_pages(&self, models: &[Model]) -> u32 {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.loaded || i.loading)
            .map(|(m, _)| models[m].num_weights_pages)
            .sum()
    }

    pub fn loaded_count(&self) -> usize {
        self.instances.iter().filter(|i| i.loaded).count()
    }

    pub fn loading_count(&self) -> usize {
        self.instances.iter().filter(|i| i.loading).count()
    }
}

#[cfg(test)]
#[path = "gpu_tests.rs"]
mod tests;
