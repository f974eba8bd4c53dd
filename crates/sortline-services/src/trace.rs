//! Pipeline trace records.
//!
//! Sinks are fire-and-forget: `write` never fails from the caller's point
//! of view. Normal parcels are sampled; exceptional parcels are always
//! recorded.

use std::collections::VecDeque;
use std::sync::Mutex;

use rand::Rng;
use serde::Serialize;
use sortline_core::{ChuteId, ParcelId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    /// e.g. `"route_planning.entered"`.
    pub stage: String,
    pub parcel_id: ParcelId,
    pub chute_ids: Vec<ChuteId>,
    pub details: String,
    pub timestamp_ms: i64,
}

pub trait TraceSink: Send + Sync {
    fn write(&self, record: TraceRecord);
}

/// Emits each record as a `tracing` event under `sortline::trace`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTraceSink;

impl TraceSink for TracingTraceSink {
    fn write(&self, record: TraceRecord) {
        tracing::info!(
            target: "sortline::trace",
            stage = %record.stage,
            parcel_id = record.parcel_id,
            chute_ids = ?record.chute_ids,
            details = %record.details,
            timestamp_ms = record.timestamp_ms,
            "trace"
        );
    }
}

/// Keeps the most recent records in memory.
#[derive(Debug)]
pub struct MemoryTraceSink {
    records: Mutex<VecDeque<TraceRecord>>,
    capacity: usize,
}

impl MemoryTraceSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        match self.records.lock() {
            Ok(r) => r.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn for_parcel(&self, parcel_id: ParcelId) -> Vec<TraceRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.parcel_id == parcel_id)
            .collect()
    }
}

impl TraceSink for MemoryTraceSink {
    fn write(&self, record: TraceRecord) {
        let mut records = match self.records.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}

/// Probabilistic sampling for non-exceptional parcels.
#[derive(Debug, Clone, Copy)]
pub struct TraceSampler {
    rate: f64,
}

impl TraceSampler {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    pub fn should_record(&self, exceptional: bool) -> bool {
        if exceptional || self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.rate
    }
}
