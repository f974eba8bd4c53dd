use std::sync::Arc;

use async_trait::async_trait;
use sortline_core::ParcelId;

use super::{ExceptionKind, Next, SortingContext, SortingStage};
use crate::congestion::{CongestionDetector, CongestionSource};
use crate::load::SortingMetrics;
use crate::overload::{OverloadContext, OverloadPolicy, OverloadReason};

/// Line-wide overload check that needs no per-parcel timing.
#[derive(Clone)]
pub struct OverloadGate {
    detector: CongestionDetector,
    policy: OverloadPolicy,
    source: Arc<dyn CongestionSource>,
    metrics: Arc<dyn SortingMetrics>,
}

impl OverloadGate {
    pub fn new(
        detector: CongestionDetector,
        policy: OverloadPolicy,
        source: Arc<dyn CongestionSource>,
        metrics: Arc<dyn SortingMetrics>,
    ) -> Self {
        Self {
            detector,
            policy,
            source,
            metrics,
        }
    }

    /// `Some` when congestion or capacity alone forces the exception chute.
    /// A forced parcel is counted as overloaded.
    pub fn forced_at_admission(&self, parcel_id: ParcelId) -> Option<OverloadReason> {
        let snapshot = self.source.collect();
        let decision = self.policy.evaluate(&OverloadContext {
            congestion: self.detector.detect(&snapshot),
            in_flight_parcels: snapshot.in_flight_parcels,
            remaining_ttl_ms: i64::MAX,
            arrival_window_ms: i64::MAX,
        });
        if !decision.should_force_exception {
            return None;
        }
        self.metrics.on_overload(parcel_id, decision.reason);
        Some(decision.reason)
    }
}

/// Applies the overload policy to a planned parcel. A forced parcel keeps
/// its planned path; only the flag changes.
pub struct OverloadEvaluationStage {
    detector: CongestionDetector,
    policy: OverloadPolicy,
    source: Arc<dyn CongestionSource>,
    metrics: Arc<dyn SortingMetrics>,
    line_transit_ms: u64,
}

impl OverloadEvaluationStage {
    pub fn new(
        detector: CongestionDetector,
        policy: OverloadPolicy,
        source: Arc<dyn CongestionSource>,
        metrics: Arc<dyn SortingMetrics>,
        line_transit_ms: u64,
    ) -> Self {
        Self {
            detector,
            policy,
            source,
            metrics,
            line_transit_ms,
        }
    }

    fn context(&self, ctx: &SortingContext) -> OverloadContext {
        let snapshot = self.source.collect();
        let elapsed = ctx.elapsed().as_millis() as i64;
        let total_ttl = ctx.path.as_ref().map_or(0, |p| p.total_ttl_ms() as i64);
        OverloadContext {
            congestion: self.detector.detect(&snapshot),
            in_flight_parcels: snapshot.in_flight_parcels,
            remaining_ttl_ms: total_ttl - elapsed,
            arrival_window_ms: (self.line_transit_ms as i64 - elapsed).max(0),
        }
    }
}

#[async_trait]
impl SortingStage for OverloadEvaluationStage {
    fn name(&self) -> &'static str {
        "overload_evaluation"
    }

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>) {
        if ctx.force_exception {
            return next.run(ctx).await;
        }

        let overload = self.context(ctx);
        let decision = self.policy.evaluate(&overload);

        if decision.should_mark_overflow {
            ctx.overflow_marked = true;
            ctx.overload_reason = Some(decision.reason);
            tracing::debug!(
                parcel_id = ctx.parcel_id,
                reason = %decision.reason,
                congestion = %overload.congestion,
                remaining_ttl_ms = overload.remaining_ttl_ms,
                "parcel marked overflow"
            );
        }

        if decision.should_force_exception {
            ctx.force_exception = true;
            ctx.flag_exception(ExceptionKind::Overload, decision.reason.to_string());
            self.metrics.on_overload(ctx.parcel_id, decision.reason);
            tracing::warn!(parcel_id = ctx.parcel_id, reason = %decision.reason, "overload forced exception");
        }

        next.run(ctx).await;
    }
}
