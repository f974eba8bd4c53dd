//! Line load tracking: the injected metrics sink.
//!
//! Components report through a `SortingMetrics` handle passed to them at
//! construction; there is no process-wide registry. `LineLoadCollector`
//! is the production sink and doubles as the congestion snapshot source:
//! an atomic in-flight counter plus a bounded window of recent outcomes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sortline_core::{CongestionSnapshot, ParcelId};

use crate::congestion::CongestionSource;
use crate::overload::OverloadReason;
use crate::path_executor::PathExecutionResult;

/// Metrics capability handed to each component.
pub trait SortingMetrics: Send + Sync {
    /// A parcel entered the pipeline.
    fn on_parcel_admitted(&self, parcel_id: ParcelId);

    /// A parcel left the pipeline. Called exactly once per admitted parcel.
    fn on_parcel_completed(&self, parcel_id: ParcelId, success: bool, latency: Duration);

    fn on_overload(&self, _parcel_id: ParcelId, _reason: OverloadReason) {}

    fn on_path_executed(&self, _parcel_id: ParcelId, _result: &PathExecutionResult) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl SortingMetrics for NoopMetrics {
    fn on_parcel_admitted(&self, _parcel_id: ParcelId) {}
    fn on_parcel_completed(&self, _parcel_id: ParcelId, _success: bool, _latency: Duration) {}
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency_ms: f64,
    success: bool,
}

/// Counters exposed for periodic reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTotals {
    pub completed: u64,
    pub failed: u64,
    pub overloaded: u64,
    pub segment_failures: u64,
}

#[derive(Debug)]
pub struct LineLoadCollector {
    in_flight: AtomicU32,
    window: Mutex<VecDeque<Sample>>,
    window_len: usize,
    completed: AtomicU64,
    failed: AtomicU64,
    overloaded: AtomicU64,
    segment_failures: AtomicU64,
}

impl LineLoadCollector {
    pub fn new(window_len: usize) -> Self {
        let window_len = window_len.max(1);
        Self {
            in_flight: AtomicU32::new(0),
            window: Mutex::new(VecDeque::with_capacity(window_len)),
            window_len,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            segment_failures: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> LoadTotals {
        LoadTotals {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            segment_failures: self.segment_failures.load(Ordering::Relaxed),
        }
    }

    fn push_sample(&self, sample: Sample) {
        let mut window = match self.window.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if window.len() == self.window_len {
            window.pop_front();
        }
        window.push_back(sample);
    }
}

impl SortingMetrics for LineLoadCollector {
    fn on_parcel_admitted(&self, _parcel_id: ParcelId) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn on_parcel_completed(&self, _parcel_id: ParcelId, success: bool, latency: Duration) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.push_sample(Sample {
            latency_ms: latency.as_secs_f64() * 1_000.0,
            success,
        });
    }

    fn on_overload(&self, _parcel_id: ParcelId, _reason: OverloadReason) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    fn on_path_executed(&self, _parcel_id: ParcelId, result: &PathExecutionResult) {
        if !result.is_success {
            self.segment_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl CongestionSource for LineLoadCollector {
    fn collect(&self) -> CongestionSnapshot {
        let window = match self.window.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (average_latency_ms, failure_ratio) = if window.is_empty() {
            (0.0, 0.0)
        } else {
            let n = window.len() as f64;
            let total: f64 = window.iter().map(|s| s.latency_ms).sum();
            let failures = window.iter().filter(|s| !s.success).count() as f64;
            (total / n, failures / n)
        };
        CongestionSnapshot {
            in_flight_parcels: self.in_flight(),
            average_latency_ms,
            failure_ratio,
        }
    }
}
