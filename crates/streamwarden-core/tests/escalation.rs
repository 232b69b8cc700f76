//! End-to-end escalation behavior through the sampler, supervisor, and
//! store, with the engine mocked at the handle seam.

use std::sync::Arc;
use std::time::Duration;

use streamwarden_core::engine::{
    mock_engine_handle_failing, mock_engine_with_script, PipelineState,
};
use streamwarden_core::health::{ErrorCategory, HealthSampler, SamplerConfig};
use streamwarden_core::status_store::StatusStore;
use streamwarden_core::supervisor::{
    LadderState, RecoveryAction, RecoverySupervisor, ReclaimPolicy, RestartPolicy,
};

fn sampler() -> HealthSampler {
    HealthSampler::new(SamplerConfig {
        artifact_dir: std::env::temp_dir().join("streamwarden-no-such-dir"),
        ..SamplerConfig::default()
    })
}

fn supervisor() -> RecoverySupervisor {
    RecoverySupervisor::new(
        RestartPolicy::default(),
        ReclaimPolicy {
            artifact_dir: std::env::temp_dir().join("streamwarden-no-such-dir"),
            ..ReclaimPolicy::default()
        },
    )
}

#[tokio::test]
async fn three_tick_outage_records_three_fatal_events_without_restart() {
    let mut sampler = sampler();
    let mut supervisor = supervisor();
    let store = Arc::new(StatusStore::default());
    let dead_engine = mock_engine_handle_failing();

    for _ in 0..3 {
        let tick = sampler.sample(&dead_engine, store.counters()).await;
        assert!(tick.probe_failed);
        store.record_snapshot(tick.snapshot.clone());
        let report = supervisor.evaluate(&tick, &dead_engine, &store).await;
        assert!(!report.restart_scheduled);
    }

    let view = store.view();
    let fatal: Vec<_> = view
        .events
        .iter()
        .filter(|e| e.category == ErrorCategory::ProcessFatal)
        .collect();
    assert_eq!(fatal.len(), 3);
    assert_eq!(view.restart_count, 0);
    assert_eq!(view.error_count, 3);
    // Three errors is below the five-error threshold.
    assert_eq!(supervisor.ladder_state(false), LadderState::Degraded);
}

#[tokio::test]
async fn sustained_outage_escalates_to_exactly_one_restart() {
    let mut sampler = sampler();
    let mut supervisor = supervisor();
    let store = Arc::new(StatusStore::default());
    let dead_engine = mock_engine_handle_failing();

    let mut scheduled_on = None;
    for tick_no in 1..=8 {
        let tick = sampler.sample(&dead_engine, store.counters()).await;
        store.record_snapshot(tick.snapshot.clone());
        let report = supervisor.evaluate(&tick, &dead_engine, &store).await;
        if report.restart_scheduled {
            assert!(scheduled_on.is_none(), "restart scheduled twice");
            scheduled_on = Some(tick_no);
            assert!(report
                .actions
                .iter()
                .any(|a| matches!(a, RecoveryAction::RestartScheduled { .. })));
        }
    }

    assert_eq!(scheduled_on, Some(5));
    assert_eq!(store.view().restart_count, 1);
    // Snapshots taken after the schedule carry the bumped counter.
    assert_eq!(store.counters().restart_count, 1);
}

#[tokio::test]
async fn stuck_pipeline_is_nudged_then_recovers() {
    let mut sampler = sampler();
    let mut supervisor = supervisor();
    let store = Arc::new(StatusStore::default());
    // Four buffering samples, a fifth that trips stuck, then recovery.
    let engine = mock_engine_with_script(vec![
        PipelineState::Buffering,
        PipelineState::Buffering,
        PipelineState::Buffering,
        PipelineState::Buffering,
        PipelineState::Buffering,
        PipelineState::Running,
    ]);

    let mut nudged_on = None;
    for tick_no in 1..=6 {
        let tick = sampler.sample(&engine, store.counters()).await;
        store.record_snapshot(tick.snapshot.clone());
        let report = supervisor.evaluate(&tick, &engine, &store).await;
        if report.actions.contains(&RecoveryAction::PipelineNudge) && nudged_on.is_none() {
            nudged_on = Some(tick_no);
        }
    }

    assert_eq!(nudged_on, Some(5));
    assert_eq!(engine.mock_nudge_count(), 1);
    let view = store.view();
    assert!(view
        .events
        .iter()
        .any(|e| e.category == ErrorCategory::StuckState));
    assert_eq!(view.restart_count, 0);
}

#[tokio::test]
async fn exhausted_ladder_keeps_nudging_but_never_restarts() {
    let mut sampler = sampler();
    let mut supervisor = supervisor();
    supervisor.set_restart_count(RestartPolicy::default().max_restarts);
    let store = Arc::new(StatusStore::default());
    store.set_restart_count(RestartPolicy::default().max_restarts);
    let dead_engine = mock_engine_handle_failing();

    for _ in 0..10 {
        let tick = sampler.sample(&dead_engine, store.counters()).await;
        store.record_snapshot(tick.snapshot.clone());
        let report = supervisor.evaluate(&tick, &dead_engine, &store).await;
        assert!(!report.restart_scheduled);
    }

    assert!(supervisor.is_exhausted());
    assert_eq!(supervisor.ladder_state(false), LadderState::Exhausted);
    assert_eq!(store.view().restart_count, RestartPolicy::default().max_restarts);
    assert_eq!(store.view().error_count, 10);
}

#[tokio::test]
async fn failure_cooldown_is_longer_than_cadence() {
    // The loop backs off after a failed probe instead of hot-looping.
    let sampler = sampler();
    assert!(sampler.config().failure_cooldown > sampler.config().interval);
    assert_eq!(sampler.config().failure_cooldown, Duration::from_secs(30));
}
