use sortline_core::config::SortingMode;
use tokio_util::sync::CancellationToken;

use super::{
    ChuteSelectionStrategy, FixedChuteStrategy, FormalChuteStrategy, RoundRobinStrategy,
    SelectionError, SelectionRequest, SelectionResult,
};

/// Dispatches a request to the strategy named by its sorting mode.
///
/// Stateless apart from the strategies it owns. A mode without a wired-up
/// strategy is a programming error and is reported, never defaulted.
pub struct ChuteSelector {
    fixed: FixedChuteStrategy,
    round_robin: RoundRobinStrategy,
    formal: Option<FormalChuteStrategy>,
}

impl ChuteSelector {
    pub fn new(formal: Option<FormalChuteStrategy>) -> Self {
        Self {
            fixed: FixedChuteStrategy,
            round_robin: RoundRobinStrategy::new(),
            formal,
        }
    }

    pub fn strategy(&self, mode: SortingMode) -> Result<&dyn ChuteSelectionStrategy, SelectionError> {
        match mode {
            SortingMode::Fixed => Ok(&self.fixed),
            SortingMode::RoundRobin => Ok(&self.round_robin),
            SortingMode::Formal => self
                .formal
                .as_ref()
                .map(|f| f as &dyn ChuteSelectionStrategy)
                .ok_or(SelectionError::StrategyNotConfigured(mode)),
        }
    }

    pub async fn select(
        &self,
        req: &SelectionRequest,
        cancel: &CancellationToken,
    ) -> Result<SelectionResult, SelectionError> {
        let strategy = self.strategy(req.mode)?;
        Ok(strategy.select(req, cancel).await)
    }

    /// Select using a numeric mode code from an upstream system.
    pub async fn select_by_code(
        &self,
        mode_code: i32,
        mut req: SelectionRequest,
        cancel: &CancellationToken,
    ) -> Result<SelectionResult, SelectionError> {
        req.mode = SortingMode::try_from(mode_code)?;
        self.select(&req, cancel).await
    }
}
