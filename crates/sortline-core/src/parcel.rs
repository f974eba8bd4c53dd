//! Parcel identity.
//!
//! Ids are derived from the detection timestamp (unix ms). Two parcels
//! detected in the same millisecond get consecutive ids; the generator
//! never hands out the same id twice, even under concurrent callers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Parcel identifier. Correlation key for every asynchronous wait.
pub type ParcelId = i64;

/// Physical destination chute identifier.
pub type ChuteId = i64;

/// Unix time in milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Issues strictly increasing parcel ids.
#[derive(Debug, Default)]
pub struct ParcelIdGenerator {
    last: AtomicI64,
}

impl ParcelIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Next id for a parcel detected now.
    pub fn next_id(&self) -> ParcelId {
        self.next_id_at(now_ms())
    }

    /// Next id for a parcel detected at `timestamp_ms`.
    ///
    /// Uses the timestamp when it is ahead of the last issued id,
    /// otherwise retries with `last + 1` until the CAS wins.
    pub fn next_id_at(&self, timestamp_ms: i64) -> ParcelId {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = if timestamp_ms > last { timestamp_ms } else { last + 1 };
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}
