use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;

use sortline_core::config::{ChuteRoute, RouteStep, SortlineConfig};
use sortline_core::{CongestionSnapshot, Direction};
use sortline_services::{CongestionSource, ExceptionKind};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Happy path
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_round_robin_parcels_reach_their_chutes() -> Result<()> {
    let config = SortlineConfig::default();
    let line = line(&config, &healthy_diverters(), None);

    for (parcel_id, expected) in [(1, 1), (2, 2), (3, 3), (4, 1)] {
        let outcome = line.orchestrator.handle_parcel_detected(parcel_id, None).await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.target_chute_id, Some(expected));
        assert_eq!(outcome.actual_chute_id, Some(expected));
        assert_eq!(outcome.exception_kind, None);
    }

    assert_eq!(line.load.in_flight(), 0);
    assert_eq!(line.load.totals().completed, 4);
    assert_eq!(line.load.totals().failed, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_pre_known_target_skips_selection() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.line.available_chutes = vec![1, 2];
    let line = line(&config, &healthy_diverters(), None);

    let outcome = line.orchestrator.handle_parcel_detected(10, Some(3)).await;
    assert_eq!(outcome.actual_chute_id, Some(3));

    // the round-robin cursor was never touched
    let outcome = line.orchestrator.handle_parcel_detected(11, None).await;
    assert_eq!(outcome.actual_chute_id, Some(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_parcels_rotate_evenly() -> Result<()> {
    let config = SortlineConfig::default();
    let line = line(&config, &healthy_diverters(), None);

    let mut parcels = JoinSet::new();
    for parcel_id in 0..30 {
        let orchestrator = line.orchestrator.clone();
        parcels.spawn(async move { orchestrator.handle_parcel_detected(parcel_id, None).await });
    }

    let mut per_chute: HashMap<i64, usize> = HashMap::new();
    while let Some(outcome) = parcels.join_next().await {
        let outcome = outcome?;
        assert!(outcome.success);
        *per_chute.entry(outcome.actual_chute_id.unwrap_or_default()).or_default() += 1;
    }
    assert_eq!(per_chute, HashMap::from([(1, 10), (2, 10), (3, 10)]));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Execution failures land in the fallback chute
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_segment_timeout_aborts_remaining_segments() -> Result<()> {
    let config = SortlineConfig::default();
    let first = ScriptedDiverter::new(1, 0, Behaviour::Hang);
    let second = ScriptedDiverter::new(2, 10, Behaviour::Succeed);
    let line = line(&config, &[first.clone(), second.clone()], None);

    let started = Instant::now();
    let outcome = line.orchestrator.handle_parcel_detected(20, Some(2)).await;

    assert!(!outcome.success);
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::Timeout));
    assert_eq!(outcome.actual_chute_id, Some(config.line.exception_chute_id));
    assert_eq!(second.calls(), 0, "segment 2 must not run after segment 1 timed out");
    assert!(started.elapsed() >= Duration::from_millis(config.topology.default_segment_ttl_ms));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refused_command_is_execution_failure() -> Result<()> {
    let config = SortlineConfig::default();
    let line = line(
        &config,
        &[ScriptedDiverter::new(1, 0, Behaviour::Refuse), ScriptedDiverter::new(2, 0, Behaviour::Succeed)],
        None,
    );

    let outcome = line.orchestrator.handle_parcel_detected(21, Some(1)).await;
    assert!(!outcome.success);
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::ExecutionFailure));
    assert_eq!(outcome.actual_chute_id, Some(999));
    assert!(outcome.failure_reason.is_some());
    assert_eq!(line.load.totals().segment_failures, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_controller_routes_to_fallback() -> Result<()> {
    let config = SortlineConfig::default();
    let line = line(&config, &[ScriptedDiverter::new(1, 0, Behaviour::Succeed)], None);

    let outcome = line.orchestrator.handle_parcel_detected(22, Some(2)).await;
    assert!(!outcome.success);
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::MissingController));
    assert_eq!(outcome.actual_chute_id, Some(999));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_in_flight_parcels() -> Result<()> {
    let config = SortlineConfig::default();
    let line = line(
        &config,
        &[ScriptedDiverter::new(1, 0, Behaviour::Hang), ScriptedDiverter::new(2, 0, Behaviour::Succeed)],
        None,
    );

    let orchestrator = line.orchestrator.clone();
    let parcel = tokio::spawn(async move { orchestrator.handle_parcel_detected(23, Some(1)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    line.orchestrator.shutdown();

    let outcome = parcel.await?;
    assert!(!outcome.success);
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::Cancelled));
    assert_eq!(outcome.actual_chute_id, Some(999));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Planning
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_degraded_diverter_replans_to_exception_chute() -> Result<()> {
    let mut config = SortlineConfig::default();
    // exception chute reachable through diverter 1 alone
    config.topology.routes.retain(|r| r.chute_id != 999);
    config.topology.routes.push(ChuteRoute {
        chute_id: 999,
        steps: vec![RouteStep {
            diverter_id: 1,
            direction: Direction::Right,
        }],
    });
    let line = line(&config, &healthy_diverters(), None);
    line.health.mark_unhealthy(2);

    let outcome = line.orchestrator.handle_parcel_detected(30, Some(3)).await;
    assert!(outcome.success, "exception route is healthy: {outcome:?}");
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::NodeDegraded));
    assert_eq!(outcome.actual_chute_id, Some(999));

    line.health.mark_healthy(2);
    let outcome = line.orchestrator.handle_parcel_detected(31, Some(3)).await;
    assert_eq!(outcome.actual_chute_id, Some(3));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_route_anywhere_takes_no_physical_action() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.topology.routes.clear();
    let diverters = healthy_diverters();
    let line = line(&config, &diverters, None);

    let outcome = line.orchestrator.handle_parcel_detected(32, Some(1)).await;
    assert!(!outcome.success);
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::PathFailure));
    assert_eq!(outcome.actual_chute_id, None);
    assert!(diverters.iter().all(|d| d.calls() == 0));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Overload
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_severe_congestion_forces_exception_chute() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.congestion.warning_in_flight = 1;
    config.congestion.severe_in_flight = 1;
    let line = line(&config, &healthy_diverters(), None);

    let outcome = line.orchestrator.handle_parcel_detected(40, None).await;
    assert!(outcome.success);
    assert_eq!(outcome.target_chute_id, Some(999));
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::Overload));
    assert_eq!(line.load.totals().overloaded, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disabled_policy_never_forces() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.congestion.warning_in_flight = 1;
    config.congestion.severe_in_flight = 1;
    config.overload.enabled = false;
    let line = line(&config, &healthy_diverters(), None);

    let outcome = line.orchestrator.handle_parcel_detected(41, None).await;
    assert_eq!(outcome.actual_chute_id, Some(1));
    assert_eq!(outcome.exception_kind, None);
    assert_eq!(line.load.totals().overloaded, 0);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Stage panics
// ══════════════════════════════════════════════════════════════════════════════

/// Healthy load on the first read, then panics on every later read.
#[derive(Default)]
struct FlakyLoad {
    reads: AtomicUsize,
}

impl CongestionSource for FlakyLoad {
    fn collect(&self) -> CongestionSnapshot {
        if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
            panic!("load counters unavailable");
        }
        CongestionSnapshot {
            in_flight_parcels: 1,
            average_latency_ms: 10.0,
            failure_ratio: 0.0,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_overload_check_still_actuates_planned_path() -> Result<()> {
    let config = SortlineConfig::default();
    let diverters = healthy_diverters();
    let flaky: Arc<dyn CongestionSource> = Arc::new(FlakyLoad::default());
    let line = line_with_congestion(&config, &diverters, None, Some(flaky));

    let outcome = line.orchestrator.handle_parcel_detected(60, None).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.target_chute_id, Some(1));
    assert_eq!(outcome.actual_chute_id, Some(1));
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::StageFailure));
    assert_eq!(diverters[0].calls(), 1);
    assert_eq!(line.load.in_flight(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_panicking_admission_check_falls_back_to_exception_chute() -> Result<()> {
    let config = SortlineConfig::default();
    let diverters = healthy_diverters();
    let flaky = Arc::new(FlakyLoad::default());
    flaky.reads.store(1, Ordering::SeqCst);
    let line = line_with_congestion(&config, &diverters, None, Some(flaky as Arc<dyn CongestionSource>));

    let outcome = line.orchestrator.handle_parcel_detected(61, None).await;
    assert_eq!(outcome.target_chute_id, Some(999));
    assert_eq!(outcome.actual_chute_id, Some(999));
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::StageFailure));
    assert!(diverters[0].calls() > 0);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Tracing
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_exceptional_parcels_are_always_traced() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.trace.sample_rate = 0.0;
    let line = line(
        &config,
        &[ScriptedDiverter::new(1, 0, Behaviour::Refuse), ScriptedDiverter::new(2, 0, Behaviour::Succeed)],
        None,
    );

    line.orchestrator.handle_parcel_detected(50, Some(1)).await;
    let stages: Vec<_> = line.traces.for_parcel(50).into_iter().map(|r| r.stage).collect();
    assert!(stages.contains(&"path_execution.completed".to_string()), "{stages:?}");
    assert!(
        !stages.contains(&"chute_selection.entered".to_string()),
        "parcel was normal when it entered selection: {stages:?}"
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_full_sampling_traces_every_stage_nested() -> Result<()> {
    let mut config = SortlineConfig::default();
    config.trace.sample_rate = 1.0;
    let line = line(&config, &healthy_diverters(), None);

    line.orchestrator.handle_parcel_detected(51, None).await;
    let stages: Vec<_> = line.traces.for_parcel(51).into_iter().map(|r| r.stage).collect();
    assert_eq!(
        stages,
        vec![
            "chute_selection.entered",
            "route_planning.entered",
            "overload_evaluation.entered",
            "path_execution.entered",
            "path_execution.completed",
            "overload_evaluation.completed",
            "route_planning.completed",
            "chute_selection.completed",
        ]
    );
    Ok(())
}
