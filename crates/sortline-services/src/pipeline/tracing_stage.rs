use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use sortline_core::now_ms;

use super::{ExceptionKind, Next, SortingContext, SortingStage};
use crate::trace::{TraceRecord, TraceSampler, TraceSink};

/// Records `<stage>.entered` and `<stage>.completed` around an inner stage.
///
/// The sampling decision is made once per parcel. A parcel that turns
/// exceptional is recorded from then on regardless of that decision.
///
/// A panic in the inner stage stops here. If the stage had not handed off
/// yet and the parcel already has a path, the rest of the chain still runs
/// so the parcel is actuated; otherwise the traversal fails.
pub struct TracedStage {
    inner: Arc<dyn SortingStage>,
    sink: Arc<dyn TraceSink>,
    sampler: TraceSampler,
}

impl TracedStage {
    pub fn new(inner: Arc<dyn SortingStage>, sink: Arc<dyn TraceSink>, sampler: TraceSampler) -> Self {
        Self { inner, sink, sampler }
    }

    fn wanted(&self, ctx: &mut SortingContext) -> bool {
        let sampled = *ctx
            .trace_sampled
            .get_or_insert_with(|| self.sampler.should_record(false));
        sampled || ctx.is_exceptional()
    }

    fn record(&self, ctx: &SortingContext, event: &str) {
        let chute_ids = ctx
            .target_chute_id
            .into_iter()
            .chain(ctx.actual_chute_id.filter(|a| Some(*a) != ctx.target_chute_id))
            .collect();
        let mut details = Vec::new();
        if let Some(kind) = ctx.exception_kind {
            details.push(format!("exception={kind:?}"));
        }
        if let Some(reason) = &ctx.exception_reason {
            details.push(format!("reason={reason}"));
        }
        if let Some(failure) = &ctx.failure_reason {
            details.push(format!("failure={failure}"));
        }
        if ctx.overflow_marked {
            details.push("overflow".to_string());
        }
        self.sink.write(TraceRecord {
            stage: format!("{}.{}", self.inner.name(), event),
            parcel_id: ctx.parcel_id,
            chute_ids,
            details: details.join(" "),
            timestamp_ms: now_ms(),
        });
    }

    async fn contain_panic(&self, ctx: &mut SortingContext, next: Next<'_>, entered: usize) {
        let stage = self.inner.name();
        let reason = format!("stage {stage} panicked");
        tracing::error!(parcel_id = ctx.parcel_id, stage, "pipeline stage panicked");

        if ctx.stages_entered != entered {
            // later stages already ran; keep what they recorded
            if ctx.exception_kind.is_none() {
                ctx.flag_exception(ExceptionKind::StageFailure, reason);
            }
        } else if ctx.path.is_some() {
            ctx.flag_exception(ExceptionKind::StageFailure, reason);
            next.run(ctx).await;
        } else {
            ctx.fail(ExceptionKind::StageFailure, reason);
        }
    }
}

#[async_trait]
impl SortingStage for TracedStage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>) {
        if self.wanted(ctx) {
            self.record(ctx, "entered");
        }
        let entered = ctx.stages_entered;
        let run = AssertUnwindSafe(self.inner.invoke(ctx, next)).catch_unwind().await;
        if run.is_err() {
            self.contain_panic(ctx, next, entered).await;
        }
        if self.wanted(ctx) {
            self.record(ctx, "completed");
        }
    }
}
