//! Per-parcel pipeline state.

use std::time::Duration;

use serde::Serialize;
use sortline_core::{ChuteId, ParcelId, SwitchingPath};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::overload::OverloadReason;
use crate::path_executor::SegmentFailureKind;
use crate::selection::FallbackCause;

/// Why a parcel left the normal routing flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    /// No route to the target nor to the exception chute. Fatal.
    PathFailure,
    /// Target chute unreachable; re-planned to the exception chute.
    UnreachableTarget,
    /// A diverter on the path is unhealthy; re-planned to the exception chute.
    NodeDegraded,
    Overload,
    Timeout,
    Cancelled,
    MissingController,
    CommunicationFailure,
    /// A strategy could not produce a normal chute.
    SelectionFallback,
    /// A segment command returned false or errored.
    ExecutionFailure,
    /// A stage panicked. The chain carried on without it when a path was
    /// already planned.
    StageFailure,
}

impl From<FallbackCause> for ExceptionKind {
    fn from(cause: FallbackCause) -> Self {
        match cause {
            FallbackCause::OverloadForced => ExceptionKind::Overload,
            FallbackCause::UpstreamNotConnected | FallbackCause::NotifyFailed => {
                ExceptionKind::CommunicationFailure
            }
            FallbackCause::UpstreamTimeout => ExceptionKind::Timeout,
            FallbackCause::Cancelled => ExceptionKind::Cancelled,
            FallbackCause::FixedChuteNotConfigured | FallbackCause::NoAvailableChutes => {
                ExceptionKind::SelectionFallback
            }
        }
    }
}

impl From<SegmentFailureKind> for ExceptionKind {
    fn from(kind: SegmentFailureKind) -> Self {
        match kind {
            SegmentFailureKind::Timeout => ExceptionKind::Timeout,
            SegmentFailureKind::Cancelled => ExceptionKind::Cancelled,
            SegmentFailureKind::MissingController => ExceptionKind::MissingController,
            SegmentFailureKind::InvalidPath
            | SegmentFailureKind::CommandFailed
            | SegmentFailureKind::DriverError => ExceptionKind::ExecutionFailure,
        }
    }
}

/// One traversal's worth of state. Owned by that traversal alone and
/// dropped when it finishes.
#[derive(Debug)]
pub struct SortingContext {
    pub parcel_id: ParcelId,
    pub detected_at: Instant,
    pub target_chute_id: Option<ChuteId>,
    pub path: Option<SwitchingPath>,
    /// Overload (or an upstream decision) condemned this parcel.
    pub force_exception: bool,
    /// Routed to the exception chute for any reason.
    pub is_exception: bool,
    pub exception_kind: Option<ExceptionKind>,
    pub exception_reason: Option<String>,
    /// Tagged as overflow by the overload policy, forced or not.
    pub overflow_marked: bool,
    pub overload_reason: Option<OverloadReason>,
    pub current_stage: &'static str,
    /// Incremented each time the chain enters a stage.
    pub stages_entered: usize,
    pub success: bool,
    pub actual_chute_id: Option<ChuteId>,
    pub failure_reason: Option<String>,
    pub planning_latency: Option<Duration>,
    pub execution_latency: Option<Duration>,
    /// Sampling decision, made once at the first traced stage.
    pub trace_sampled: Option<bool>,
    pub cancel: CancellationToken,
}

impl SortingContext {
    pub fn new(parcel_id: ParcelId, pre_known_target: Option<ChuteId>, cancel: CancellationToken) -> Self {
        Self {
            parcel_id,
            detected_at: Instant::now(),
            target_chute_id: pre_known_target,
            path: None,
            force_exception: false,
            is_exception: false,
            exception_kind: None,
            exception_reason: None,
            overflow_marked: false,
            overload_reason: None,
            current_stage: "",
            stages_entered: 0,
            success: false,
            actual_chute_id: None,
            failure_reason: None,
            planning_latency: None,
            execution_latency: None,
            trace_sampled: None,
            cancel,
        }
    }

    /// Route to the exception chute; recoverable.
    pub fn flag_exception(&mut self, kind: ExceptionKind, reason: impl Into<String>) {
        self.is_exception = true;
        self.exception_kind = Some(kind);
        self.exception_reason = Some(reason.into());
    }

    /// Mark the traversal failed.
    pub fn fail(&mut self, kind: ExceptionKind, reason: impl Into<String>) {
        let reason = reason.into();
        self.success = false;
        self.is_exception = true;
        self.exception_kind = Some(kind);
        self.failure_reason = Some(reason.clone());
        if self.exception_reason.is_none() {
            self.exception_reason = Some(reason);
        }
    }

    /// Exceptional parcels are always traced.
    pub fn is_exceptional(&self) -> bool {
        self.is_exception || self.force_exception || self.failure_reason.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.detected_at.elapsed()
    }
}
