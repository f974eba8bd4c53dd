//! sortline-core: shared types and configuration.
//! All other sortline crates depend on this one.

pub mod config;
pub mod congestion;
pub mod lock_event;
pub mod parcel;
pub mod path;

pub use congestion::{CongestionLevel, CongestionSnapshot, CongestionThresholds};
pub use lock_event::{CardNo, LockEvent, LockEventKind};
pub use parcel::{now_ms, ChuteId, ParcelId, ParcelIdGenerator};
pub use path::{Direction, DiverterId, Segment, SwitchingPath};
