//! Overload policy: decides whether a parcel is forced to the exception
//! chute, or merely marked as overflow, given current congestion and its
//! own timing budget.
//!
//! Clauses are evaluated in strict priority order and the first match
//! wins. Later conditions that are also true are not reported.

use serde::Serialize;
use sortline_core::config::OverloadPolicyConfig;
use sortline_core::CongestionLevel;

/// Per-parcel facts the policy decides on.
#[derive(Debug, Clone, Copy)]
pub struct OverloadContext {
    pub congestion: CongestionLevel,
    pub in_flight_parcels: u32,
    /// Time left on the planned path's TTL budget. May be negative.
    pub remaining_ttl_ms: i64,
    /// Time until the parcel reaches the first diverter. May be negative.
    pub arrival_window_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadReason {
    Disabled,
    SevereCongestion,
    OverCapacity,
    InsufficientTtl,
    InsufficientArrivalWindow,
    Normal,
}

impl std::fmt::Display for OverloadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OverloadReason::Disabled => "overload policy disabled",
            OverloadReason::SevereCongestion => "severe congestion",
            OverloadReason::OverCapacity => "in-flight over/near capacity",
            OverloadReason::InsufficientTtl => "insufficient remaining TTL",
            OverloadReason::InsufficientArrivalWindow => "insufficient arrival window",
            OverloadReason::Normal => "normal",
        };
        f.write_str(s)
    }
}

/// Fresh per evaluation; never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverloadDecision {
    pub should_force_exception: bool,
    pub should_mark_overflow: bool,
    pub reason: OverloadReason,
}

impl OverloadDecision {
    fn pass(reason: OverloadReason) -> Self {
        Self {
            should_force_exception: false,
            should_mark_overflow: false,
            reason,
        }
    }

    fn tagged(force: bool, reason: OverloadReason) -> Self {
        Self {
            should_force_exception: force,
            should_mark_overflow: true,
            reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverloadPolicy {
    config: OverloadPolicyConfig,
}

impl OverloadPolicy {
    pub fn new(config: OverloadPolicyConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, ctx: &OverloadContext) -> OverloadDecision {
        let c = &self.config;

        if !c.enabled {
            return OverloadDecision::pass(OverloadReason::Disabled);
        }

        if ctx.congestion == CongestionLevel::Severe && c.force_on_severe {
            return OverloadDecision::tagged(true, OverloadReason::SevereCongestion);
        }

        if ctx.in_flight_parcels > c.max_in_flight {
            return OverloadDecision::tagged(c.force_on_over_capacity, OverloadReason::OverCapacity);
        }

        if ctx.remaining_ttl_ms < c.min_required_ttl_ms as i64 {
            return OverloadDecision::tagged(c.force_on_timeout, OverloadReason::InsufficientTtl);
        }

        if ctx.arrival_window_ms < c.min_arrival_window_ms as i64 {
            return OverloadDecision::tagged(
                c.force_on_window_miss,
                OverloadReason::InsufficientArrivalWindow,
            );
        }

        OverloadDecision::pass(OverloadReason::Normal)
    }
}
