//! Release throttling: spacing between parcel releases per congestion level.
//!
//! Intervals:
//!   Normal:  `normal_interval_ms`
//!   Warning: `warning_interval_ms`
//!   Severe:  `severe_interval_ms`, or no release at all with `pause_on_severe`

use std::time::Duration;

use sortline_core::config::ThrottleConfig;
use sortline_core::CongestionLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseDecision {
    /// False while releases are paused.
    pub allow: bool,
    /// Spacing to keep before the next release.
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ReleaseThrottle {
    config: ThrottleConfig,
}

impl ReleaseThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config }
    }

    pub fn interval_for(&self, level: CongestionLevel) -> Duration {
        let ms = match level {
            CongestionLevel::Normal => self.config.normal_interval_ms,
            CongestionLevel::Warning => self.config.warning_interval_ms,
            CongestionLevel::Severe => self.config.severe_interval_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn decide(&self, level: CongestionLevel) -> ReleaseDecision {
        if !self.config.enabled {
            return ReleaseDecision {
                allow: true,
                interval: Duration::from_millis(self.config.normal_interval_ms),
            };
        }

        ReleaseDecision {
            allow: !(level == CongestionLevel::Severe && self.config.pause_on_severe),
            interval: self.interval_for(level),
        }
    }
}
