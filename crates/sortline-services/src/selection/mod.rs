//! Chute selection: fixed, round-robin, and upstream-delegated ("formal")
//! strategies behind one dispatcher.
//!
//! Every strategy honours the overload flag first: a forced request gets
//! the exception chute without any mode-specific work.

mod composite;
mod fixed;
mod formal;
mod round_robin;

use async_trait::async_trait;
use serde::Serialize;
use sortline_core::config::{SortingMode, UnknownSortingMode};
use sortline_core::{ChuteId, ParcelId};
use tokio_util::sync::CancellationToken;

pub use composite::ChuteSelector;
pub use fixed::FixedChuteStrategy;
pub use formal::{FormalChuteStrategy, PendingAssignments, ResolveOutcome};
pub use round_robin::RoundRobinStrategy;

/// Everything a strategy may look at, derived from the sorting context.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    pub parcel_id: ParcelId,
    pub mode: SortingMode,
    pub exception_chute_id: ChuteId,
    pub fixed_chute_id: Option<ChuteId>,
    pub available_chutes: Vec<ChuteId>,
    /// Set when overload has already condemned this parcel.
    pub overload_forced: bool,
}

/// Why a strategy fell back to the exception chute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackCause {
    OverloadForced,
    FixedChuteNotConfigured,
    NoAvailableChutes,
    UpstreamNotConnected,
    NotifyFailed,
    UpstreamTimeout,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    pub target_chute_id: ChuteId,
    pub is_exception: bool,
    pub reason: String,
    pub cause: Option<FallbackCause>,
}

impl SelectionResult {
    pub fn chute(target_chute_id: ChuteId, reason: impl Into<String>) -> Self {
        Self {
            target_chute_id,
            is_exception: false,
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn exception(req: &SelectionRequest, cause: FallbackCause, reason: impl Into<String>) -> Self {
        Self {
            target_chute_id: req.exception_chute_id,
            is_exception: true,
            reason: reason.into(),
            cause: Some(cause),
        }
    }

    /// Shared precedence rule: `Some` when the request is overload-forced.
    pub fn overload_forced(req: &SelectionRequest) -> Option<Self> {
        req.overload_forced.then(|| {
            Self::exception(
                req,
                FallbackCause::OverloadForced,
                "overload forced parcel to exception chute",
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// Dispatch asked for a mode nobody wired up. Programming error.
    #[error("no strategy configured for sorting mode {0:?}")]
    StrategyNotConfigured(SortingMode),
    #[error(transparent)]
    UnknownMode(#[from] UnknownSortingMode),
}

#[async_trait]
pub trait ChuteSelectionStrategy: Send + Sync {
    async fn select(&self, req: &SelectionRequest, cancel: &CancellationToken) -> SelectionResult;
}
