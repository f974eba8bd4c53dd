//! The sorting pipeline: an ordered middleware chain run once per parcel.
//!
//! Each stage receives the mutable context and a `Next` continuation.
//! Calling `next.run(ctx)` hands control to the remaining stages; not
//! calling it ends the traversal there. Stages never return errors. They
//! record failures on the context instead.

mod context;
mod execution;
mod overload;
mod planning;
mod selection;
mod tracing_stage;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use context::{ExceptionKind, SortingContext};
pub use execution::PathExecutionStage;
pub use overload::{OverloadEvaluationStage, OverloadGate};
pub use planning::RoutePlanningStage;
pub use selection::{ChuteSelectionStage, LineSettings};
pub use tracing_stage::TracedStage;

use crate::trace::{TraceSampler, TraceSink};

#[async_trait]
pub trait SortingStage: Send + Sync {
    /// Stable name used in traces, e.g. `"route_planning"`.
    fn name(&self) -> &'static str;

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>);
}

/// Continuation over the stages that have not run yet.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn SortingStage>],
}

impl<'a> Next<'a> {
    /// A continuation with nothing left to run.
    pub fn end() -> Next<'static> {
        Next { stages: &[] }
    }

    pub fn run<'c>(self, ctx: &'c mut SortingContext) -> BoxFuture<'c, ()>
    where
        'a: 'c,
    {
        Box::pin(async move {
            if let Some((stage, rest)) = self.stages.split_first() {
                ctx.current_stage = stage.name();
                ctx.stages_entered += 1;
                stage.invoke(ctx, Next { stages: rest }).await;
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct SortingPipeline {
    stages: Vec<Arc<dyn SortingStage>>,
}

impl SortingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn then(mut self, stage: Arc<dyn SortingStage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Wrap every stage added so far in a `TracedStage`.
    pub fn traced(self, sink: Arc<dyn TraceSink>, sampler: TraceSampler) -> Self {
        let stages = self
            .stages
            .into_iter()
            .map(|inner| Arc::new(TracedStage::new(inner, sink.clone(), sampler)) as Arc<dyn SortingStage>)
            .collect();
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut SortingContext) {
        Next { stages: &self.stages }.run(ctx).await;
    }
}
