//! Congestion types: load snapshots, severity levels, thresholds.

use serde::{Deserialize, Serialize};

/// Point-in-time line load. Produced by a collector, consumed once per check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CongestionSnapshot {
    pub in_flight_parcels: u32,
    pub average_latency_ms: f64,
    /// 0.0 – 1.0
    pub failure_ratio: f64,
}

/// Coarse line-load classification. Ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CongestionLevel {
    #[default]
    Normal,
    Warning,
    Severe,
}

impl std::fmt::Display for CongestionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CongestionLevel::Normal => "normal",
            CongestionLevel::Warning => "warning",
            CongestionLevel::Severe => "severe",
        };
        f.write_str(s)
    }
}

/// Warning and severe thresholds per dimension. A value at or above a
/// threshold trips it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionThresholds {
    pub warning_in_flight: u32,
    pub severe_in_flight: u32,
    pub warning_latency_ms: f64,
    pub severe_latency_ms: f64,
    pub warning_failure_ratio: f64,
    pub severe_failure_ratio: f64,
    /// Rolling sample window used by the load collector.
    pub window: usize,
}

impl Default for CongestionThresholds {
    fn default() -> Self {
        Self {
            warning_in_flight: 50,
            severe_in_flight: 100,
            warning_latency_ms: 3_000.0,
            severe_latency_ms: 5_000.0,
            warning_failure_ratio: 0.1,
            severe_failure_ratio: 0.3,
            window: 200,
        }
    }
}
