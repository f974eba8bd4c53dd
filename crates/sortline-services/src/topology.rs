//! Path generation from the pre-resolved topology.
//!
//! No graph search happens here: each chute maps to a fixed list of
//! (diverter, direction) steps. Every generated path falls back to the
//! exception chute, so a route to the exception chute must exist.

use std::collections::HashMap;

use sortline_core::config::TopologyConfig;
use sortline_core::{now_ms, ChuteId, Segment, SwitchingPath};

/// Maps a target chute to a switching path. `None` means unreachable.
pub trait PathGenerator: Send + Sync {
    fn generate(&self, target_chute_id: ChuteId) -> Option<SwitchingPath>;
}

#[derive(Debug, Clone)]
pub struct TopologyPathGenerator {
    routes: HashMap<ChuteId, Vec<Segment>>,
    exception_chute_id: ChuteId,
}

impl TopologyPathGenerator {
    pub fn new(topology: &TopologyConfig, exception_chute_id: ChuteId) -> Self {
        let mut routes = HashMap::new();
        for route in &topology.routes {
            if route.steps.is_empty() {
                tracing::warn!(chute_id = route.chute_id, "route has no steps, chute unreachable");
                continue;
            }
            let segments = route
                .steps
                .iter()
                .enumerate()
                .map(|(i, step)| Segment {
                    sequence: i as u32 + 1,
                    diverter_id: step.diverter_id,
                    direction: step.direction,
                    ttl_ms: topology.default_segment_ttl_ms,
                })
                .collect();
            routes.insert(route.chute_id, segments);
        }

        if !routes.contains_key(&exception_chute_id) {
            tracing::error!(
                exception_chute_id,
                "no route to the exception chute; failed parcels have nowhere to go"
            );
        }

        Self {
            routes,
            exception_chute_id,
        }
    }

    pub fn exception_chute_id(&self) -> ChuteId {
        self.exception_chute_id
    }

    pub fn chutes(&self) -> impl Iterator<Item = ChuteId> + '_ {
        self.routes.keys().copied()
    }
}

impl PathGenerator for TopologyPathGenerator {
    fn generate(&self, target_chute_id: ChuteId) -> Option<SwitchingPath> {
        let segments = self.routes.get(&target_chute_id)?;
        Some(SwitchingPath::new(
            target_chute_id,
            self.exception_chute_id,
            segments.clone(),
            now_ms(),
        ))
    }
}
