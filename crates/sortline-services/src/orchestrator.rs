//! Per-parcel entry point. Builds the stage chain from configuration,
//! runs it once per detected parcel and reports the outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use sortline_core::config::SortlineConfig;
use sortline_core::{now_ms, ChuteId, ParcelId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::congestion::{CongestionDetector, CongestionSource};
use crate::diverter::DiverterLookup;
use crate::health::NodeHealthChecker;
use crate::load::SortingMetrics;
use crate::overload::OverloadPolicy;
use crate::path_executor::PathExecutor;
use crate::pipeline::{
    ChuteSelectionStage, ExceptionKind, LineSettings, OverloadEvaluationStage, OverloadGate,
    PathExecutionStage, RoutePlanningStage, SortingContext, SortingPipeline,
};
use crate::selection::{ChuteSelector, FormalChuteStrategy, PendingAssignments};
use crate::topology::PathGenerator;
use crate::trace::{TraceSampler, TraceSink};
use crate::upstream::UpstreamClient;

/// Result of one pipeline traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortOutcome {
    pub parcel_id: ParcelId,
    pub success: bool,
    pub target_chute_id: Option<ChuteId>,
    /// Where the parcel physically went. `None` when nothing was actuated.
    pub actual_chute_id: Option<ChuteId>,
    pub exception_kind: Option<ExceptionKind>,
    pub failure_reason: Option<String>,
}

impl From<&SortingContext> for SortOutcome {
    fn from(ctx: &SortingContext) -> Self {
        Self {
            parcel_id: ctx.parcel_id,
            success: ctx.success,
            target_chute_id: ctx.target_chute_id,
            actual_chute_id: ctx.actual_chute_id,
            exception_kind: ctx.exception_kind,
            failure_reason: ctx.failure_reason.clone(),
        }
    }
}

/// Handed to the completion callback once per parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParcelCompletion {
    pub parcel_id: ParcelId,
    pub success: bool,
    pub timestamp_ms: i64,
}

pub type CompletionCallback = Arc<dyn Fn(ParcelCompletion) + Send + Sync>;

/// Upstream wiring for the formal sorting mode.
pub struct UpstreamLink {
    pub client: Arc<dyn UpstreamClient>,
    pub pending: PendingAssignments,
}

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub paths: Arc<dyn PathGenerator>,
    pub diverters: Arc<dyn DiverterLookup>,
    pub health: Arc<dyn NodeHealthChecker>,
    pub congestion: Arc<dyn CongestionSource>,
    pub metrics: Arc<dyn SortingMetrics>,
    pub trace_sink: Arc<dyn TraceSink>,
    pub upstream: Option<UpstreamLink>,
}

pub struct SortingOrchestrator {
    pipeline: SortingPipeline,
    metrics: Arc<dyn SortingMetrics>,
    on_complete: Option<CompletionCallback>,
    cancel: CancellationToken,
}

impl SortingOrchestrator {
    pub fn new(config: &SortlineConfig, parts: Collaborators) -> Self {
        let formal = parts.upstream.map(|link| {
            FormalChuteStrategy::new(
                link.client,
                link.pending,
                Duration::from_millis(config.upstream.response_timeout_ms),
            )
        });
        let selector = Arc::new(ChuteSelector::new(formal));
        let detector = CongestionDetector::new(config.congestion.clone());
        let policy = OverloadPolicy::new(config.overload.clone());

        let gate = OverloadGate::new(
            detector.clone(),
            policy.clone(),
            parts.congestion.clone(),
            parts.metrics.clone(),
        );
        let pipeline = SortingPipeline::new()
            .then(Arc::new(
                ChuteSelectionStage::new(selector, LineSettings::from(&config.line)).with_overload_gate(gate),
            ))
            .then(Arc::new(RoutePlanningStage::new(
                parts.paths,
                parts.health,
                config.line.exception_chute_id,
            )))
            .then(Arc::new(OverloadEvaluationStage::new(
                detector,
                policy,
                parts.congestion,
                parts.metrics.clone(),
                config.line.line_transit_ms,
            )))
            .then(Arc::new(PathExecutionStage::new(
                PathExecutor::new(parts.diverters),
                parts.metrics.clone(),
            )))
            .traced(parts.trace_sink, TraceSampler::new(config.trace.sample_rate));

        tracing::info!(stages = ?pipeline.stage_names(), mode = ?config.line.sorting_mode, "sorting pipeline ready");

        Self::from_pipeline(pipeline, parts.metrics)
    }

    /// Use a hand-built stage chain.
    pub fn from_pipeline(pipeline: SortingPipeline, metrics: Arc<dyn SortingMetrics>) -> Self {
        Self {
            pipeline,
            metrics,
            on_complete: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_completion(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Run the pipeline for one parcel. Never fails; problems are in the
    /// returned outcome.
    pub async fn handle_parcel_detected(&self, parcel_id: ParcelId, pre_known_target: Option<ChuteId>) -> SortOutcome {
        let started = Instant::now();
        self.metrics.on_parcel_admitted(parcel_id);

        let mut ctx = SortingContext::new(parcel_id, pre_known_target, self.cancel.child_token());
        let run = AssertUnwindSafe(self.pipeline.run(&mut ctx)).catch_unwind().await;
        if run.is_err() {
            tracing::error!(parcel_id, stage = ctx.current_stage, "pipeline stage panicked");
            ctx.fail(ExceptionKind::StageFailure, format!("stage {} panicked", ctx.current_stage));
        }

        let outcome = SortOutcome::from(&ctx);
        self.metrics.on_parcel_completed(parcel_id, outcome.success, started.elapsed());
        if let Some(callback) = &self.on_complete {
            callback(ParcelCompletion {
                parcel_id,
                success: outcome.success,
                timestamp_ms: now_ms(),
            });
        }

        if outcome.success {
            tracing::debug!(parcel_id, actual_chute_id = ?outcome.actual_chute_id, "parcel sorted");
        } else {
            tracing::warn!(
                parcel_id,
                kind = ?outcome.exception_kind,
                reason = outcome.failure_reason.as_deref().unwrap_or(""),
                "parcel not sorted to target"
            );
        }
        outcome
    }

    /// Cancel every in-flight traversal. Waits on upstream assignments and
    /// segment commands resolve as cancelled.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
