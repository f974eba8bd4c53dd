use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;

use super::{ExceptionKind, Next, SortingContext, SortingStage};
use crate::load::SortingMetrics;
use crate::path_executor::PathExecutor;

/// Drives the planned path on the hardware. A forced-exception parcel
/// still executes the path it was planned with.
pub struct PathExecutionStage {
    executor: PathExecutor,
    metrics: Arc<dyn SortingMetrics>,
}

impl PathExecutionStage {
    pub fn new(executor: PathExecutor, metrics: Arc<dyn SortingMetrics>) -> Self {
        Self { executor, metrics }
    }
}

#[async_trait]
impl SortingStage for PathExecutionStage {
    fn name(&self) -> &'static str {
        "path_execution"
    }

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>) {
        let Some(path) = ctx.path.clone() else {
            ctx.fail(ExceptionKind::PathFailure, "no switching path to execute");
            return;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.executor.execute(&path, &ctx.cancel))
            .catch_unwind()
            .await;
        ctx.execution_latency = Some(started.elapsed());

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(parcel_id = ctx.parcel_id, "path execution panicked");
                ctx.actual_chute_id = Some(path.fallback_chute_id);
                ctx.fail(ExceptionKind::ExecutionFailure, "path execution panicked");
                return;
            }
        };

        self.metrics.on_path_executed(ctx.parcel_id, &result);
        ctx.actual_chute_id = Some(result.actual_chute_id);
        ctx.success = result.is_success;

        if let Some(failure) = &result.failure {
            ctx.fail(failure.kind.into(), failure.reason.clone());
        }

        tracing::debug!(
            parcel_id = ctx.parcel_id,
            target_chute_id = path.target_chute_id,
            actual_chute_id = result.actual_chute_id,
            success = result.is_success,
            "path executed"
        );

        next.run(ctx).await;
    }
}
