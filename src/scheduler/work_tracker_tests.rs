//! Tests for the demand/capacity balancer.

use super::*;

const SLO: u64 = 100_000_000;
const MS: i64 = 1_000_000;

fn tracker(n_gpus: usize, n_models: usize) -> WorkTracker {
    WorkTracker::new(n_gpus, n_models, SLO)
}

#[test]
fn demand_for_unhosted_model_stays_undistributed() {
    let t = tracker(2, 3);
    let d = t.add_request(1, 5 * MS, SLO, 0);
    assert_eq!(d.model_id, 1);
    assert_eq!(t.outstanding(1), 5 * MS);
    assert_eq!(t.allocation(1, 0), 0);
    assert_eq!(t.allocation(1, 1), 0);
}

#[test]
fn high_demand_model_is_chosen_for_loading() {
    let t = tracker(1, 3);
    t.add_request(0, 2 * MS, SLO, 0);
    t.add_request(2, 9 * MS, SLO, 0);
    // Model 2 carries the most outstanding work.
    assert_eq!(t.load_model(0, false, 0), Some(2));
}

#[test]
fn load_below_threshold_is_refused() {
    let t = tracker(1, 2);
    t.add_request(0, MS / 2, SLO, 0);
    assert_eq!(t.load_model(0, false, 0), None);
}

#[test]
fn eviction_doubles_the_load_threshold() {
    let t = tracker(1, 2);
    t.add_request(0, MS + 1, SLO, 0);
    assert_eq!(t.load_model(0, true, 0), None);
    t.add_request(0, MS + 1, SLO, 0);
    assert_eq!(t.load_model(0, true, 0), Some(0));
}

#[test]
fn committed_load_distributes_outstanding_work() {
    let t = tracker(2, 1);
    t.add_request(0, 10 * MS, SLO, 0);
    let chosen = t.load_model(0, false, 0);
    assert_eq!(chosen, Some(0));
    // Loading counts as a placement target.
    assert_eq!(t.allocation(0, 0), 10 * MS);
    assert_eq!(t.gpu_outstanding(0), 10 * MS + MS); // includes the 1ms floor
    assert_eq!(t.gpu_model_count(0), 1);
}

#[test]
fn failed_load_rolls_back_the_placement() {
    let t = tracker(1, 1);
    t.add_request(0, 10 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    t.load_model_complete(0, 0, false);
    assert!(!t.hosted_on(0, 0));
    assert_eq!(t.allocation(0, 0), 0);
    assert_eq!(t.gpu_model_count(0), 0);
    // The demand remains and the model can be chosen again.
    assert_eq!(t.load_model(0, false, 0), Some(0));
}

#[test]
fn successful_load_marks_the_model_hosted() {
    let t = tracker(1, 1);
    t.add_request(0, 10 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    t.load_model_complete(0, 0, true);
    assert!(t.hosted_on(0, 0));
    // Already placed here: not a load candidate again.
    assert_eq!(t.load_model(0, false, 0), None);
}

#[test]
fn work_splits_across_hosting_gpus() {
    let t = tracker(2, 1);
    t.add_request(0, 10 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("gpu0");
    t.load_model_complete(0, 0, true);
    t.load_model(1, false, 0).expect("gpu1");
    t.load_model_complete(1, 0, true);
    let total = t.allocation(0, 0) + t.allocation(0, 1);
    assert_eq!(total, t.outstanding(0));
    assert!((t.allocation(0, 0) - t.allocation(0, 1)).abs() <= 1);
}

#[test]
fn request_completed_credits_outstanding() {
    let t = tracker(1, 1);
    let d = t.add_request(0, 10 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    t.load_model_complete(0, 0, true);
    t.request_completed(d);
    assert_eq!(t.outstanding(0), 0);
    assert_eq!(t.allocation(0, 0), 0);
    assert_eq!(t.gpu_outstanding(0), MS); // back to the floor
}

#[test]
fn duplicate_credit_saturates_at_zero() {
    let t = tracker(1, 1);
    let d = t.add_request(0, 10 * MS, SLO, 0);
    t.request_completed(d);
    t.request_completed(d);
    assert_eq!(t.outstanding(0), 0);
}

#[test]
fn idle_resident_is_evicted_before_busy_one() {
    let t = tracker(1, 2);
    for model in 0..2 {
        t.add_request(model, 10 * MS, SLO, 0);
        t.load_model(0, false, 0).expect("candidate");
        t.load_model_complete(0, model, true);
    }
    // Drain model 0's work so it becomes an idle resident.
    t.request_completed(Demand { model_id: 0, size: 10 * MS });
    assert_eq!(t.evict_model(0), Some(0));
    assert!(!t.hosted_on(0, 0));
    assert!(t.hosted_on(1, 0));
}

#[test]
fn lowest_priority_busy_resident_is_evicted_when_none_idle() {
    let t = tracker(1, 2);
    t.add_request(0, 20 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    t.load_model_complete(0, 0, true);
    t.add_request(1, 5 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    t.load_model_complete(0, 1, true);
    assert_eq!(t.evict_model(0), Some(1));
}

#[test]
fn model_loading_on_this_gpu_is_not_an_eviction_victim() {
    let t = tracker(1, 2);
    t.add_request(0, 10 * MS, SLO, 0);
    t.load_model(0, false, 0).expect("candidate");
    // Model 0 is mid-load; nothing is resident yet.
    assert_eq!(t.evict_model(0), None);
}

#[test]
fn unserved_demand_expires_after_its_slo_window() {
    let t = tracker(1, 1);
    t.add_request(0, 10 * MS, SLO, 0);
    assert_eq!(t.outstanding(0), 10 * MS);
    // Past the SLO window and still unhosted: the demand is dead weight.
    assert_eq!(t.load_model(0, false, SLO + 1), None);
    assert_eq!(t.outstanding(0), 0);
}

#[test]
fn disconnect_drops_all_placements_on_the_gpu() {
    let t = tracker(2, 2);
    for model in 0..2 {
        t.add_request(model, 10 * MS, SLO, 0);
        t.load_model(0, false, 0).expect("candidate");
        t.load_model_complete(0, model, true);
    }
    t.drop_gpu(0);
    assert!(!t.hosted_on(0, 0));
    assert!(!t.hosted_on(1, 0));
    assert_eq!(t.gpu_model_count(0), 0);
    assert_eq!(t.gpu_outstanding(0), MS);
    // Demand survives the disconnect and can drive a load elsewhere.
    assert_eq!(t.outstanding(0), 10 * MS);
    assert!(t.load_model(1, false, 0).is_some());
}

#[test]
fn recently_touched_model_wins_ties() {
    let t = tracker(1, 2);
    t.add_request(0, 10 * MS, SLO, 0);
    t.add_request(1, 10 * MS, SLO, 0);
    // Equal outstanding and completed: the later touch wins.
    assert_eq!(t.load_model(0, false, 0), Some(1));
}
