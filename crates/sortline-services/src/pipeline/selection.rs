use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use sortline_core::config::{LineConfig, SortingMode};
use sortline_core::ChuteId;

use super::{ExceptionKind, Next, OverloadGate, SortingContext, SortingStage};
use crate::selection::{ChuteSelector, SelectionRequest};

/// The slice of line configuration chute selection needs.
#[derive(Debug, Clone)]
pub struct LineSettings {
    pub mode: SortingMode,
    pub exception_chute_id: ChuteId,
    pub fixed_chute_id: Option<ChuteId>,
    pub available_chutes: Vec<ChuteId>,
}

impl From<&LineConfig> for LineSettings {
    fn from(line: &LineConfig) -> Self {
        Self {
            mode: line.sorting_mode,
            exception_chute_id: line.exception_chute_id,
            fixed_chute_id: line.fixed_chute_id,
            available_chutes: line.available_chutes.clone(),
        }
    }
}

/// Resolves the target chute unless the parcel arrived with one.
pub struct ChuteSelectionStage {
    selector: Arc<ChuteSelector>,
    line: LineSettings,
    gate: Option<OverloadGate>,
}

impl ChuteSelectionStage {
    pub fn new(selector: Arc<ChuteSelector>, line: LineSettings) -> Self {
        Self {
            selector,
            line,
            gate: None,
        }
    }

    /// Check line-wide overload before asking any strategy, so a condemned
    /// parcel never costs an upstream round trip.
    pub fn with_overload_gate(mut self, gate: OverloadGate) -> Self {
        self.gate = Some(gate);
        self
    }

    fn request(&self, ctx: &SortingContext) -> SelectionRequest {
        SelectionRequest {
            parcel_id: ctx.parcel_id,
            mode: self.line.mode,
            exception_chute_id: self.line.exception_chute_id,
            fixed_chute_id: self.line.fixed_chute_id,
            available_chutes: self.line.available_chutes.clone(),
            overload_forced: ctx.force_exception,
        }
    }

    /// Admission gate, then the strategy for the configured mode.
    async fn resolve(&self, ctx: &mut SortingContext) {
        if let Some(gate) = &self.gate {
            if let Some(reason) = gate.forced_at_admission(ctx.parcel_id) {
                ctx.force_exception = true;
                ctx.overflow_marked = true;
                ctx.overload_reason = Some(reason);
                ctx.flag_exception(ExceptionKind::Overload, reason.to_string());
            }
        }

        let req = self.request(ctx);
        match self.selector.select(&req, &ctx.cancel).await {
            Ok(result) => {
                ctx.target_chute_id = Some(result.target_chute_id);
                if result.is_exception {
                    let kind = result
                        .cause
                        .map(ExceptionKind::from)
                        .unwrap_or(ExceptionKind::SelectionFallback);
                    if !ctx.is_exception {
                        ctx.flag_exception(kind, result.reason);
                    }
                }
            }
            Err(e) => {
                tracing::error!(parcel_id = ctx.parcel_id, error = %e, "chute selection failed");
                ctx.target_chute_id = Some(self.line.exception_chute_id);
                ctx.flag_exception(ExceptionKind::SelectionFallback, e.to_string());
            }
        }
    }
}

#[async_trait]
impl SortingStage for ChuteSelectionStage {
    fn name(&self) -> &'static str {
        "chute_selection"
    }

    async fn invoke(&self, ctx: &mut SortingContext, next: Next<'_>) {
        if ctx.target_chute_id.is_some() {
            tracing::debug!(parcel_id = ctx.parcel_id, "target chute already known; skipping selection");
            return next.run(ctx).await;
        }

        if AssertUnwindSafe(self.resolve(ctx)).catch_unwind().await.is_err() {
            tracing::error!(parcel_id = ctx.parcel_id, "chute selection panicked");
            ctx.target_chute_id = Some(self.line.exception_chute_id);
            ctx.flag_exception(ExceptionKind::SelectionFallback, "chute selection panicked");
        }

        next.run(ctx).await;
    }
}
