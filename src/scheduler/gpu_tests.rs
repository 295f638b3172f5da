//! Tests for per-GPU dispatch, loading, and eviction.

use super::*;
use crate::api::{BatchedModelState, InferenceRequest};
use crate::scheduler::request::Request;

const MS: u64 = 1_000_000;

fn cfg() -> SchedulerConfig {
    SchedulerConfig::default()
}

fn make_models(specs: &[(u32, Vec<u32>, Vec<u64>)]) -> Vec<Model> {
    specs
        .iter()
        .enumerate()
        .map(|(id, (pages, sizes, ests))| {
            Model::new(
                &BatchedModelState {
                    id,
                    name: format!("m{id}"),
                    num_weights_pages: *pages,
                    batch_sizes: sizes.clone(),
                    exec_estimates: ests.clone(),
                    weights_load_estimate: 8 * MS,
                },
                &cfg(),
            )
        })
        .collect()
}

fn make_gpu(total_pages: u32, n_models: usize, min_pages: u32) -> Gpu {
    Gpu::new(0, 0, 0, total_pages, 1380, n_models, min_pages)
}

fn enqueue(models: &mut [Model], model_id: usize, slo_ns: u64, now: u64) -> (u64, u64) {
    let r = Request::new(
        InferenceRequest { user_id: 0, model_id, slo_ns, input: vec![0u8; 8] },
        Box::new(|_| {}),
        now,
    );
    let meta = (r.id, r.deadline);
    models[model_id].enqueue(r);
    meta
}

fn mark_loaded(gpu: &mut Gpu, models: &[Model], model_id: usize) {
    gpu.instances[model_id].loaded = true;
    gpu.instances[model_id].version = 1;
    gpu.free_pages -= models[model_id].num_weights_pages;
}

#[test]
fn eligible_strategy_dispatches_an_action() {
    let mut models = make_models(&[(4, vec![1, 2], vec![MS, 2 * MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    mark_loaded(&mut gpu, &models, 0);

    let (rid, deadline) = enqueue(&mut models, 0, 10 * MS, 0);
    gpu.push_request_strategies(&models[0], rid, deadline, &cfg());

    let out = gpu.check_pending(&mut models, &cfg(), 0);
    assert_eq!(out.actions.len(), 1);
    assert!(out.timed_out.is_empty());
    let OutstandingAction::Infer(a) = &out.actions[0] else {
        panic!("expected an infer action");
    };
    assert_eq!(a.batch_size, 1);
    assert_eq!(a.earliest, a.expected_start);
    assert_eq!(
        a.latest,
        (deadline - cfg().buffer_ns).min(a.expected_start + cfg().latest_delta_ns)
    );
    // Exec time was reserved.
    assert_eq!(gpu.exec.available_at(), a.expected_start + a.expected_duration);
}

#[test]
fn distant_strategy_waits_for_the_lookahead_window() {
    let mut models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    mark_loaded(&mut gpu, &models, 0);

    // 100ms SLO: the plan prefers running late to batching early, so its
    // priority sits ~94ms out, far past the 10ms lookahead.
    let (rid, deadline) = enqueue(&mut models, 0, 100 * MS, 0);
    gpu.push_request_strategies(&models[0], rid, deadline, &cfg());

    let out = gpu.check_pending(&mut models, &cfg(), 0);
    assert!(out.actions.is_empty());
    assert_eq!(gpu.strategies.len(), 1);

    // Near the deadline the plan becomes eligible.
    let out = gpu.check_pending(&mut models, &cfg(), 90 * MS);
    assert_eq!(out.actions.len(), 1);
}

#[test]
fn stale_version_strategies_are_discarded() {
    let mut models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    mark_loaded(&mut gpu, &models, 0);

    let (rid, deadline) = enqueue(&mut models, 0, 10 * MS, 0);
    gpu.push_request_strategies(&models[0], rid, deadline, &cfg());
    // A reload bumped the version after the plan was made.
    gpu.instances[0].version = 2;

    let out = gpu.check_pending(&mut models, &cfg(), 0);
    assert!(out.actions.is_empty());
    assert!(gpu.strategies.is_empty());
    assert_eq!(models[0].queue_len(), 1);
}

#[test]
fn unloaded_instance_strategies_are_discarded() {
    let mut models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    mark_loaded(&mut gpu, &models, 0);

    let (rid, deadline) = enqueue(&mut models, 0, 10 * MS, 0);
    gpu.push_request_strategies(&models[0], rid, deadline, &cfg());
    gpu.instances[0].loaded = false;

    let out = gpu.check_pending(&mut models, &cfg(), 0);
    assert!(out.actions.is_empty());
}

#[test]
fn try_load_reserves_pages_and_schedules_transfer() {
    let models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    let tracker = WorkTracker::new(1, 1, 100 * MS);
    tracker.add_request(0, (10 * MS) as i64, 100 * MS, 0);

    let actions = gpu.try_load(&models, &tracker, &cfg(), 0);
    assert_eq!(actions.len(), 1);
    let OutstandingAction::Load(load) = &actions[0] else {
        panic!("expected a load action");
    };
    assert_eq!(load.model_id, 0);
    assert_eq!(load.version, 1);
    assert_eq!(gpu.free_pages, 6);
    assert!(gpu.instances[0].loading);
    assert_eq!(gpu.pending_loads.len(), 1);
    assert_eq!(gpu.pending_loads[0].version, load.version);
    assert_eq!(gpu.pending_loads[0].available_at, gpu.loadweights.available_at());
    assert_eq!(gpu.loadweights.available_at(), load.earliest + load.expected_duration);

    // One load at a time.
    assert!(gpu.try_load(&models, &tracker, &cfg(), 0).is_empty());
}

#[test]
fn exactly_enough_pages_loads_without_eviction() {
    let models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(4, 1, 4);
    let tracker = WorkTracker::new(1, 1, 100 * MS);
    tracker.add_request(0, (10 * MS) as i64, 100 * MS, 0);

    let actions = gpu.try_load(&models, &tracker, &cfg(), 0);
    assert_eq!(actions.len(), 1);
    assert!(matches!(actions[0], OutstandingAction::Load(_)));
    assert_eq!(gpu.free_pages, 0);
}

#[test]
fn page_shortage_evicts_first_and_retries_later() {
    let models = make_models(&[(6, vec![1], vec![MS]), (6, vec![1], vec![MS])]);
    let mut gpu = make_gpu(8, 2, 6);
    let tracker = WorkTracker::new(1, 2, 100 * MS);

    // Model 0 resident with little outstanding work.
    tracker.add_request(0, (2 * MS) as i64, 100 * MS, 0);
    tracker.load_model(0, false, 0).expect("candidate");
    tracker.load_model_complete(0, 0, true);
    mark_loaded(&mut gpu, &models, 0);
    assert_eq!(gpu.free_pages, 2);

    // Model 1 brings much more demand than model 0.
    tracker.add_request(1, (50 * MS) as i64, 100 * MS, 0);

    let actions = gpu.try_load(&models, &tracker, &cfg(), 0);
    assert_eq!(actions.len(), 1);
    let OutstandingAction::Evict(evict) = &actions[0] else {
        panic!("expected an evict action");
    };
    assert_eq!(evict.model_id, 0);
    // Victim stops serving immediately; pages return on confirmation.
    assert!(!gpu.instances[0].loaded);
    assert_eq!(gpu.free_pages, 2);
    assert!(!gpu.instances[1].loading);

    // Eviction confirms, pages return, and the next cycle loads model 1.
    gpu.evict_complete(evict, models[0].num_weights_pages);
    assert_eq!(gpu.free_pages, 8);
    let actions = gpu.try_load(&models, &tracker, &cfg(), MS);
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], OutstandingAction::Load(l) if l.model_id == 1));
}

#[test]
fn load_success_bumps_version_once() {
    let models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    let tracker = WorkTracker::new(1, 1, 100 * MS);
    tracker.add_request(0, (10 * MS) as i64, 100 * MS, 0);

    let actions = gpu.try_load(&models, &tracker, &cfg(), 0);
    let OutstandingAction::Load(load) = &actions[0] else {
        panic!("expected a load action");
    };
    gpu.load_success(load);
    let inst = gpu.instances[0];
    assert!(inst.loaded);
    assert!(!inst.loading);
    assert_eq!(inst.version, 1);
    assert!(gpu.pending_loads.is_empty());
}

#[test]
fn load_failure_restores_pages() {
    let models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    let tracker = WorkTracker::new(1, 1, 100 * MS);
    tracker.add_request(0, (10 * MS) as i64, 100 * MS, 0);

    let actions = gpu.try_load(&models, &tracker, &cfg(), 0);
    let OutstandingAction::Load(load) = &actions[0] else {
        panic!("expected a load action");
    };
    gpu.load_failed(load, models[0].num_weights_pages);
    let inst = gpu.instances[0];
    assert!(!inst.loaded);
    assert!(!inst.loading);
    assert_eq!(inst.version, 0);
    assert_eq!(gpu.free_pages, 10);
}

#[test]
fn disconnect_zeroes_gpu_state() {
    let mut models = make_models(&[(4, vec![1], vec![MS])]);
    let mut gpu = make_gpu(10, 1, 4);
    mark_loaded(&mut gpu, &models, 0);
    let (rid, deadline) = enqueue(&mut models, 0, 10 * MS, 0);
    gpu.push_request_strategies(&models[0], rid, deadline, &cfg());

    gpu.disconnect();
    assert!(!gpu.alive);
    assert_eq!(gpu.free_pages, gpu.total_pages);
    assert_eq!(gpu.loaded_count(), 0);
    assert!(gpu.strategies.is_empty());
    // A dead GPU neither dispatches nor loads.
    assert!(gpu.check_pending(&mut models, &cfg(), 0).actions.is_empty());
    let tracker = WorkTracker::new(1, 1, 100 * MS);
    assert!(gpu.try_load(&models, &tracker, &cfg(), 0).is_empty());
}

#[test]
fn used_pages_never_exceed_total() {
    let models = make_models(&[(4, vec![1], vec![MS]), (5, vec![1], vec![MS])]);
    let mut gpu = make_gpu(9, 2, 4);
    let tracker = WorkTracker::new(1, 2, 100 * MS);
    tracker.add_request(0, (10 * MS) as i64, 100 * MS, 0);
    tracker.add_request(1, (10 * MS) as i64, 100 * MS, 0);

    let first = gpu.try_load(&models, &tracker, &cfg(), 0);
    assert_eq!(first.len(), 1);
    if let OutstandingAction::Load(l) = &first[0] {
        gpu.load_success(l);
        tracker.load_model_complete(gpu.id, l.model_id, true);
    }
    let second = gpu.try_load(&models, &tracker, &cfg(), MS);
    assert_eq!(second.len(), 1);
    assert_eq!(gpu.used_pages(&models) + gpu.free_pages, gpu.total_pages);
    assert!(gpu.used_pages(&models) <= gpu.total_pages);
}
