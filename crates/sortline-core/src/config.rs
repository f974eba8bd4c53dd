//! Configuration system for sortline.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SORTLINE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sortline/config.toml
//!   3. ~/.config/sortline/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::congestion::CongestionThresholds;
use crate::lock_event::CardNo;
use crate::parcel::ChuteId;
use crate::path::{DiverterId, Direction};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SortlineConfig {
    pub line: LineConfig,
    pub upstream: UpstreamConfig,
    pub congestion: CongestionThresholds,
    pub overload: OverloadPolicyConfig,
    pub throttle: ThrottleConfig,
    pub trace: TraceConfig,
    pub topology: TopologyConfig,
    pub emc: EmcConfig,
}

/// How target chutes are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortingMode {
    /// Every parcel goes to one configured chute.
    Fixed,
    /// Cycle through the available chutes.
    RoundRobin,
    /// Ask the upstream routing service.
    Formal,
}

impl TryFrom<i32> for SortingMode {
    type Error = UnknownSortingMode;

    /// Numeric codes used by upstream systems: 0 formal, 1 fixed, 2 round-robin.
    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(SortingMode::Formal),
            1 => Ok(SortingMode::Fixed),
            2 => Ok(SortingMode::RoundRobin),
            other => Err(UnknownSortingMode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown sorting mode code {0}")]
pub struct UnknownSortingMode(pub i32);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    /// Fallback destination for anything that cannot be routed normally.
    pub exception_chute_id: ChuteId,
    pub sorting_mode: SortingMode,
    /// Target for `SortingMode::Fixed`. Must be positive to be used.
    pub fixed_chute_id: Option<ChuteId>,
    /// Rotation set for `SortingMode::RoundRobin`.
    pub available_chutes: Vec<ChuteId>,
    /// Estimated time from detection to the first diverter.
    pub line_transit_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// How long the formal strategy waits for a chute assignment.
    pub response_timeout_ms: u64,
    /// Assignment delay of the daemon's simulated routing service.
    pub simulated_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadPolicyConfig {
    pub enabled: bool,
    pub force_on_severe: bool,
    pub force_on_over_capacity: bool,
    pub force_on_timeout: bool,
    pub force_on_window_miss: bool,
    /// In-flight count above which a parcel is over capacity.
    pub max_in_flight: u32,
    pub min_required_ttl_ms: u64,
    pub min_arrival_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub normal_interval_ms: u64,
    pub warning_interval_ms: u64,
    pub severe_interval_ms: u64,
    /// Stop admitting parcels entirely while congestion is severe.
    pub pause_on_severe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Fraction of normal parcels whose stage events are recorded. 0.0 – 1.0.
    pub sample_rate: f64,
}

/// Pre-resolved routes from the infeed to each chute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub default_segment_ttl_ms: u64,
    pub routes: Vec<ChuteRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChuteRoute {
    pub chute_id: ChuteId,
    pub steps: Vec<RouteStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStep {
    pub diverter_id: DiverterId,
    pub direction: Direction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmcConfig {
    pub card_no: CardNo,
    /// Unique per running instance. Empty = derived from the process id.
    pub instance_id: String,
    pub lock_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Peer gives up waiting for ResetComplete after this long. 0 = wait forever.
    pub peer_resume_timeout_ms: u64,
    /// Directory holding the per-card lock files.
    pub lock_dir: PathBuf,
    /// UDP port for lock notifications. 0 = notifications disabled.
    pub listen_port: u16,
    pub peers: Vec<SocketAddr>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            exception_chute_id: 999,
            sorting_mode: SortingMode::RoundRobin,
            fixed_chute_id: None,
            available_chutes: vec![1, 2, 3],
            line_transit_ms: 2_000,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 3_000,
            simulated_delay_ms: 50,
        }
    }
}

impl Default for OverloadPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_on_severe: true,
            force_on_over_capacity: false,
            force_on_timeout: true,
            force_on_window_miss: false,
            max_in_flight: 100,
            min_required_ttl_ms: 500,
            min_arrival_window_ms: 200,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            normal_interval_ms: 300,
            warning_interval_ms: 500,
            severe_interval_ms: 1_000,
            pause_on_severe: false,
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { sample_rate: 0.1 }
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        let step = |diverter_id, direction| RouteStep {
            diverter_id,
            direction,
        };
        Self {
            default_segment_ttl_ms: 5_000,
            routes: vec![
                ChuteRoute {
                    chute_id: 1,
                    steps: vec![step(1, Direction::Left)],
                },
                ChuteRoute {
                    chute_id: 2,
                    steps: vec![step(1, Direction::Straight), step(2, Direction::Left)],
                },
                ChuteRoute {
                    chute_id: 3,
                    steps: vec![step(1, Direction::Straight), step(2, Direction::Right)],
                },
                ChuteRoute {
                    chute_id: 999,
                    steps: vec![step(1, Direction::Straight), step(2, Direction::Straight)],
                },
            ],
        }
    }
}

impl Default for EmcConfig {
    fn default() -> Self {
        Self {
            card_no: 0,
            instance_id: String::new(),
            lock_timeout_ms: 10_000,
            ack_timeout_ms: 3_000,
            peer_resume_timeout_ms: 60_000,
            lock_dir: runtime_dir(),
            listen_port: 0,
            peers: Vec::new(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("sortline")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("sortline")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SortlineConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SortlineConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SORTLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SortlineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject configurations the core cannot operate safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.line.exception_chute_id <= 0 {
            return invalid(format!(
                "line.exception_chute_id must be positive, got {}",
                self.line.exception_chute_id
            ));
        }

        let t = &self.throttle;
        if t.normal_interval_ms > t.warning_interval_ms || t.warning_interval_ms > t.severe_interval_ms
        {
            return invalid("throttle intervals must be non-decreasing (normal <= warning <= severe)".into());
        }

        if !(0.0..=1.0).contains(&self.trace.sample_rate) {
            return invalid(format!(
                "trace.sample_rate must be within [0, 1], got {}",
                self.trace.sample_rate
            ));
        }

        let c = &self.congestion;
        if c.warning_in_flight > c.severe_in_flight
            || c.warning_latency_ms > c.severe_latency_ms
            || c.warning_failure_ratio > c.severe_failure_ratio
        {
            return invalid("congestion warning thresholds must not exceed severe thresholds".into());
        }

        let exception_route = self
            .topology
            .routes
            .iter()
            .find(|r| r.chute_id == self.line.exception_chute_id);
        match exception_route {
            Some(route) if !route.steps.is_empty() => {}
            _ => {
                return invalid(format!(
                    "topology has no route to exception chute {}",
                    self.line.exception_chute_id
                ))
            }
        }

        Ok(())
    }

    /// Apply SORTLINE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SORTLINE_LINE__SORTING_MODE") {
            match v.as_str() {
                "fixed" => self.line.sorting_mode = SortingMode::Fixed,
                "round_robin" => self.line.sorting_mode = SortingMode::RoundRobin,
                "formal" => self.line.sorting_mode = SortingMode::Formal,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("SORTLINE_LINE__EXCEPTION_CHUTE_ID") {
            if let Ok(id) = v.parse() {
                self.line.exception_chute_id = id;
            }
        }
        if let Ok(v) = std::env::var("SORTLINE_LINE__FIXED_CHUTE_ID") {
            self.line.fixed_chute_id = v.parse().ok();
        }
        if let Ok(v) = std::env::var("SORTLINE_UPSTREAM__RESPONSE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.upstream.response_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SORTLINE_OVERLOAD__ENABLED") {
            self.overload.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SORTLINE_THROTTLE__ENABLED") {
            self.throttle.enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SORTLINE_TRACE__SAMPLE_RATE") {
            if let Ok(rate) = v.parse() {
                self.trace.sample_rate = rate;
            }
        }
        if let Ok(v) = std::env::var("SORTLINE_EMC__CARD_NO") {
            if let Ok(card) = v.parse() {
                self.emc.card_no = card;
            }
        }
        if let Ok(v) = std::env::var("SORTLINE_EMC__INSTANCE_ID") {
            self.emc.instance_id = v;
        }
    }
}
