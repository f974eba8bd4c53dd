//! TTL-bounded path execution.
//!
//! Segments run strictly in sequence order. The first failure abandons
//! the whole path and the parcel is routed to the path's fallback chute;
//! earlier segments earn no partial credit. Each segment gets a deadline
//! equal to its TTL. Exceeding it is reported as a timeout, distinct from
//! a command that returned false.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sortline_core::path::DiverterId;
use sortline_core::{ChuteId, Segment, SwitchingPath};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::diverter::DiverterLookup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentFailureKind {
    /// Path has no segments.
    InvalidPath,
    MissingController,
    /// Command did not complete before the segment TTL.
    Timeout,
    /// Command completed but reported failure.
    CommandFailed,
    /// Driver returned an error.
    DriverError,
    /// External cancellation, not TTL.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFailure {
    pub kind: SegmentFailureKind,
    pub sequence: Option<u32>,
    pub diverter_id: Option<DiverterId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExecutionResult {
    pub is_success: bool,
    /// Target chute on success, fallback chute on any abort.
    pub actual_chute_id: ChuteId,
    pub failure: Option<SegmentFailure>,
}

impl PathExecutionResult {
    fn completed(path: &SwitchingPath) -> Self {
        Self {
            is_success: true,
            actual_chute_id: path.target_chute_id,
            failure: None,
        }
    }

    fn aborted(path: &SwitchingPath, failure: SegmentFailure) -> Self {
        Self {
            is_success: false,
            actual_chute_id: path.fallback_chute_id,
            failure: Some(failure),
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.reason.as_str())
    }
}

#[derive(Clone)]
pub struct PathExecutor {
    diverters: Arc<dyn DiverterLookup>,
}

impl PathExecutor {
    pub fn new(diverters: Arc<dyn DiverterLookup>) -> Self {
        Self { diverters }
    }

    pub async fn execute(&self, path: &SwitchingPath, cancel: &CancellationToken) -> PathExecutionResult {
        if !path.is_executable() {
            return PathExecutionResult::aborted(
                path,
                SegmentFailure {
                    kind: SegmentFailureKind::InvalidPath,
                    sequence: None,
                    diverter_id: None,
                    reason: format!("path to chute {} has no segments", path.target_chute_id),
                },
            );
        }

        for segment in path.segments() {
            if let Err(failure) = self.run_segment(segment, cancel).await {
                tracing::warn!(
                    target_chute_id = path.target_chute_id,
                    fallback_chute_id = path.fallback_chute_id,
                    sequence = segment.sequence,
                    diverter_id = segment.diverter_id,
                    kind = ?failure.kind,
                    "path aborted"
                );
                return PathExecutionResult::aborted(path, failure);
            }
        }

        tracing::debug!(target_chute_id = path.target_chute_id, "path completed");
        PathExecutionResult::completed(path)
    }

    async fn run_segment(&self, segment: &Segment, cancel: &CancellationToken) -> Result<(), SegmentFailure> {
        let fail = |kind: SegmentFailureKind, reason: String| SegmentFailure {
            kind,
            sequence: Some(segment.sequence),
            diverter_id: Some(segment.diverter_id),
            reason,
        };

        let controller = self.diverters.by_id(segment.diverter_id).ok_or_else(|| {
            fail(
                SegmentFailureKind::MissingController,
                format!("diverter {} has no registered controller", segment.diverter_id),
            )
        })?;

        let ttl = Duration::from_millis(segment.ttl_ms);
        let deadline = Instant::now() + ttl;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(fail(
                    SegmentFailureKind::Cancelled,
                    format!(
                        "operation cancelled at segment {} (diverter {})",
                        segment.sequence, segment.diverter_id
                    ),
                ));
            }
            r = tokio::time::timeout_at(deadline, controller.actuate(segment.direction, deadline)) => r,
        };

        match outcome {
            Err(_elapsed) => Err(fail(
                SegmentFailureKind::Timeout,
                format!(
                    "segment {} (diverter {}) exceeded its TTL of {} ms",
                    segment.sequence, segment.diverter_id, segment.ttl_ms
                ),
            )),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(fail(
                SegmentFailureKind::CommandFailed,
                format!(
                    "segment {} (diverter {}) command to {} failed",
                    segment.sequence, segment.diverter_id, segment.direction
                ),
            )),
            Ok(Err(e)) => Err(fail(
                SegmentFailureKind::DriverError,
                format!("segment {} (diverter {}): {e}", segment.sequence, segment.diverter_id),
            )),
        }
    }
}
