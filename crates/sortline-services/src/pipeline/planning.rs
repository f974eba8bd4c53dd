use std::sync::Arc;

use async_trait::async_trait;
use sortline_core::ChuteId;
use tokio::time::Instant;

use super::{ExceptionKind, Next, SortingContext, SortingStage};
use crate::health::NodeHealthChecker;
use crate::topology::PathGenerator;

/// Turns the target chute into a switching path, falling back to the
/// exception chute when the target has no route or crosses a degraded
/// diverter. Ends the traversal when not even the exception chute is
/// reachable.
pub struct RoutePlanningStage {
    generator: Arc<dyn PathGenerator>,
    health: Arc<dyn NodeHealthChecker>,
    exception_chute_id: ChuteId,
}

impl RoutePlanningStage {
    pub fn new(
        generator: Arc<dyn PathGenerator>,
        health: Arc<dyn NodeHealthChecker>,
        exception_chute_id: ChuteId,
    ) -> Self {
        Self {
            generator,
            health,
            exception_chute_id,
        }
    }

    fn plan(&self, ctx: &mut SortingContext) -> bool {
        let target = match ctx.target_chute_id {
            Some(t) => t,
            None => {
                ctx.fail(ExceptionKind::PathFailure, "no target chute resolved");
                return false;
            }
        };

        let mut path = self.generator.generate(target);
        if path.is_none() && target != self.exception_chute_id {
            tracing::warn!(
                parcel_id = ctx.parcel_id,
                target_chute_id = target,
                "no route to target chute; using exception chute"
            );
            ctx.flag_exception(
                ExceptionKind::UnreachableTarget,
                format!("no route to chute {target}"),
            );
            path = self.generator.generate(self.exception_chute_id);
        }

        let Some(mut path) = path else {
            tracing::error!(
                parcel_id = ctx.parcel_id,
                exception_chute_id = self.exception_chute_id,
                "no route to exception chute"
            );
            ctx.fail(
                ExceptionKind::PathFailure,
                format!("no route to chute {target} or exception chute {}", self.exception_chute_id),
            );
            return false;
        };

        let report = self.health.validate(&path);
        if !report.is_healthy && path.target_chute_id != self.exception_chute_id {
            tracing::warn!(
                parcel_id = ctx.parcel_id,
                unhealthy = ?report.unhealthy_nodes,
                "path crosses degraded diverters; re-planning to exception chute"
            );
            ctx.flag_exception(
                ExceptionKind::NodeDegraded,
                format!("unhealthy diverters {:?}", report.unhealthy_nodes),
            );
            match self.generator.generate(self.exception_chute_id) {
                Some(p) => path = p,
                None => {
                    ctx.fail(
                        ExceptionKind::PathFailure,
                        format!("no route to exception chute {}", self.exception_chute_id),
                    );
                    return false;
                }
            }
        }

        ctx.target_chute_id = Some(path.target_chute_id);
        ctx.path = Some(path);
        true
    }
}

#[async_trait]
impl SortingStage for RoutePlanningStage {
    fn name(&self) -> &'static str {
        "route_planning"
    }

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>) {
        let started = Instant::now();
        let planned = self.plan(ctx);
        ctx.planning_latency = Some(started.elapsed());
        if planned {
            next.run(ctx).await;
        }
    }
}
