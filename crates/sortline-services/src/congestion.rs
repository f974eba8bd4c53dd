//! Congestion detection: classifies a load snapshot.
//!
//! Severe conditions are checked first across every dimension; only when
//! none fires are the warning conditions checked. A single severe
//! indicator therefore wins even if the others sit at warning level.

use sortline_core::{CongestionLevel, CongestionSnapshot, CongestionThresholds};

/// Anything that can produce the current line load. Polled, not pushed.
pub trait CongestionSource: Send + Sync {
    fn collect(&self) -> CongestionSnapshot;
}

#[derive(Debug, Clone)]
pub struct CongestionDetector {
    thresholds: CongestionThresholds,
}

impl CongestionDetector {
    pub fn new(thresholds: CongestionThresholds) -> Self {
        Self { thresholds }
    }

    pub fn detect(&self, snapshot: &CongestionSnapshot) -> CongestionLevel {
        let t = &self.thresholds;

        if snapshot.in_flight_parcels >= t.severe_in_flight
            || snapshot.average_latency_ms >= t.severe_latency_ms
            || snapshot.failure_ratio >= t.severe_failure_ratio
        {
            return CongestionLevel::Severe;
        }

        if snapshot.in_flight_parcels >= t.warning_in_flight
            || snapshot.average_latency_ms >= t.warning_latency_ms
            || snapshot.failure_ratio >= t.warning_failure_ratio
        {
            return CongestionLevel::Warning;
        }

        CongestionLevel::Normal
    }

    pub fn thresholds(&self) -> &CongestionThresholds {
        &self.thresholds
    }
}
