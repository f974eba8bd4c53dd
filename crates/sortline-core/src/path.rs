//! Switching paths: the ordered diverter actuations that carry a parcel
//! to its chute.
//!
//! Topology is resolved ahead of time; a path is just the list of
//! (diverter, direction) steps with a TTL each. Segments run strictly in
//! sequence-number order.

use serde::{Deserialize, Serialize};

use crate::parcel::ChuteId;

/// Diverter identifier.
pub type DiverterId = i64;

/// Deflection a diverter applies to a passing parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Straight,
    Left,
    Right,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Direction::Straight => "straight",
            Direction::Left => "left",
            Direction::Right => "right",
        };
        f.write_str(s)
    }
}

/// One diverter actuation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 1-based position within the path.
    pub sequence: u32,
    pub diverter_id: DiverterId,
    pub direction: Direction,
    /// Max time allowed for this actuation to complete.
    pub ttl_ms: u64,
}

/// Target chute, fallback chute, and the ordered segments between them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchingPath {
    pub target_chute_id: ChuteId,
    /// Where the parcel ends up if any segment fails.
    pub fallback_chute_id: ChuteId,
    segments: Vec<Segment>,
    /// Unix ms at generation time.
    pub generated_at_ms: i64,
}

impl SwitchingPath {
    /// Build a path. Segments are sorted by sequence number.
    pub fn new(
        target_chute_id: ChuteId,
        fallback_chute_id: ChuteId,
        mut segments: Vec<Segment>,
        generated_at_ms: i64,
    ) -> Self {
        segments.sort_by_key(|s| s.sequence);
        Self {
            target_chute_id,
            fallback_chute_id,
            segments,
            generated_at_ms,
        }
    }

    /// Segments in execution order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// A path with no segments cannot be executed.
    pub fn is_executable(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Sum of all segment TTLs.
    pub fn total_ttl_ms(&self) -> u64 {
        self.segments.iter().map(|s| s.ttl_ms).sum()
    }

    /// Diverter ids touched by this path, in order.
    pub fn diverter_ids(&self) -> impl Iterator<Item = DiverterId> + '_ {
        self.segments.iter().map(|s| s.diverter_id)
    }
}
