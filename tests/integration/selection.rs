use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use sortline_core::config::{SortingMode, SortlineConfig};
use sortline_services::selection::{ChuteSelector, FormalChuteStrategy, SelectionError, SelectionRequest};
use sortline_services::{ExceptionKind, PendingAssignments, ResolveOutcome};

use crate::*;

fn formal_config() -> SortlineConfig {
    let mut config = SortlineConfig::default();
    config.line.sorting_mode = SortingMode::Formal;
    config
}

// ══════════════════════════════════════════════════════════════════════════════
//  Formal mode through the whole pipeline
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_upstream_assignment_drives_the_parcel() -> Result<()> {
    let config = formal_config();
    let pending = PendingAssignments::new();
    let upstream = ScriptedUpstream::answering(pending.clone(), &[(60, 3, 200)]);
    let line = line(&config, &healthy_diverters(), Some(upstream.clone()));

    let outcome = line.orchestrator.handle_parcel_detected(60, None).await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.actual_chute_id, Some(3));
    assert_eq!(upstream.notified(), vec![60]);
    assert!(pending.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_silent_upstream_times_out_to_exception_chute() -> Result<()> {
    let config = formal_config();
    let pending = PendingAssignments::new();
    let upstream = ScriptedUpstream::answering(pending.clone(), &[]);
    let line = line(&config, &healthy_diverters(), Some(upstream));

    let started = Instant::now();
    let outcome = line.orchestrator.handle_parcel_detected(61, None).await;

    assert!(started.elapsed() >= Duration::from_millis(config.upstream.response_timeout_ms));
    assert_eq!(outcome.target_chute_id, Some(999));
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::Timeout));
    assert!(pending.is_empty(), "timed-out wait must be removed");

    // a late answer finds nobody waiting
    assert_eq!(pending.resolve(61, 2), ResolveOutcome::NotFound);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_upstream_is_never_notified() -> Result<()> {
    let config = formal_config();
    let upstream = Arc::new(ScriptedUpstream {
        disconnected: true,
        ..ScriptedUpstream::default()
    });
    let line = line(&config, &healthy_diverters(), Some(upstream.clone()));

    let outcome = line.orchestrator.handle_parcel_detected(62, None).await;
    assert_eq!(outcome.target_chute_id, Some(999));
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::CommunicationFailure));
    assert!(upstream.notified().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overloaded_line_skips_upstream() -> Result<()> {
    let mut config = formal_config();
    config.congestion.warning_in_flight = 1;
    config.congestion.severe_in_flight = 1;
    let pending = PendingAssignments::new();
    let upstream = ScriptedUpstream::answering(pending, &[(63, 2, 10)]);
    let line = line(&config, &healthy_diverters(), Some(upstream.clone()));

    let outcome = line.orchestrator.handle_parcel_detected(63, None).await;
    assert_eq!(outcome.exception_kind, Some(ExceptionKind::Overload));
    assert_eq!(outcome.target_chute_id, Some(999));
    assert!(upstream.notified().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_upstream_wait() -> Result<()> {
    let config = formal_config();
    let pending = PendingAssignments::new();
    let upstream = ScriptedUpstream::answering(pending.clone(), &[]);
    let line = line(&config, &healthy_diverters(), Some(upstream));

    let orchestrator = line.orchestrator.clone();
    let parcel = tokio::spawn(async move { orchestrator.handle_parcel_detected(64, None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(pending.contains(64));
    line.orchestrator.shutdown();

    let outcome = parcel.await?;
    assert_eq!(outcome.target_chute_id, Some(999));
    assert!(!pending.contains(64));
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
//  Dispatcher
// ══════════════════════════════════════════════════════════════════════════════

fn request(mode: SortingMode) -> SelectionRequest {
    SelectionRequest {
        parcel_id: 70,
        mode,
        exception_chute_id: 999,
        fixed_chute_id: Some(5),
        available_chutes: vec![1, 2],
        overload_forced: false,
    }
}

#[tokio::test]
async fn test_numeric_mode_codes() -> Result<()> {
    let pending = PendingAssignments::new();
    let upstream = ScriptedUpstream::answering(pending.clone(), &[]);
    let selector = ChuteSelector::new(Some(FormalChuteStrategy::new(
        upstream,
        pending,
        Duration::from_millis(10),
    )));
    let cancel = CancellationToken::new();

    let fixed = selector.select_by_code(1, request(SortingMode::Formal), &cancel).await?;
    assert_eq!(fixed.target_chute_id, 5);

    let rr = selector.select_by_code(2, request(SortingMode::Formal), &cancel).await?;
    assert_eq!(rr.target_chute_id, 1);

    let err = selector
        .select_by_code(7, request(SortingMode::Fixed), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SelectionError::UnknownMode(_)));
    Ok(())
}

#[tokio::test]
async fn test_formal_without_upstream_is_reported_not_defaulted() -> Result<()> {
    let selector = ChuteSelector::new(None);
    let err = selector
        .select(&request(SortingMode::Formal), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, SelectionError::StrategyNotConfigured(SortingMode::Formal));
    Ok(())
}
