//! Diverter health: which nodes are currently safe to route through.

use std::sync::Arc;

use dashmap::DashSet;
use sortline_core::path::DiverterId;
use sortline_core::SwitchingPath;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealthReport {
    pub is_healthy: bool,
    pub unhealthy_nodes: Vec<DiverterId>,
}

pub trait NodeHealthChecker: Send + Sync {
    fn validate(&self, path: &SwitchingPath) -> NodeHealthReport;
}

/// Concurrent set of diverters reported unhealthy by the driver layer.
#[derive(Debug, Clone, Default)]
pub struct NodeHealthRegistry {
    unhealthy: Arc<DashSet<DiverterId>>,
}

impl NodeHealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unhealthy(&self, diverter_id: DiverterId) {
        if self.unhealthy.insert(diverter_id) {
            tracing::warn!(diverter_id, "diverter marked unhealthy");
        }
    }

    pub fn mark_healthy(&self, diverter_id: DiverterId) {
        if self.unhealthy.remove(&diverter_id).is_some() {
            tracing::info!(diverter_id, "diverter healthy again");
        }
    }

    pub fn is_healthy(&self, diverter_id: DiverterId) -> bool {
        !self.unhealthy.contains(&diverter_id)
    }
}

impl NodeHealthChecker for NodeHealthRegistry {
    fn validate(&self, path: &SwitchingPath) -> NodeHealthReport {
        let unhealthy_nodes: Vec<_> = path
            .diverter_ids()
            .filter(|id| self.unhealthy.contains(id))
            .collect();
        NodeHealthReport {
            is_healthy: unhealthy_nodes.is_empty(),
            unhealthy_nodes,
        }
    }
}
