use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChuteSelectionStrategy, FallbackCause, SelectionRequest, SelectionResult};

/// Sends every parcel to the configured fixed chute.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedChuteStrategy;

impl FixedChuteStrategy {
    pub fn select_now(&self, req: &SelectionRequest) -> SelectionResult {
        if let Some(forced) = SelectionResult::overload_forced(req) {
            return forced;
        }

        match req.fixed_chute_id {
            Some(chute) if chute > 0 => SelectionResult::chute(chute, "fixed chute"),
            _ => SelectionResult::exception(
                req,
                FallbackCause::FixedChuteNotConfigured,
                "fixed chute not configured",
            ),
        }
    }
}

#[async_trait]
impl ChuteSelectionStrategy for FixedChuteStrategy {
    async fn select(&self, req: &SelectionRequest, _cancel: &CancellationToken) -> SelectionResult {
        self.select_now(req)
    }
}
