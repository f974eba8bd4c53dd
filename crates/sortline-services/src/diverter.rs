//! Diverter controllers: the hardware-facing side of path execution.
//!
//! Mapping a direction to a physical signal is the driver's business; the
//! core only hands over the direction and a deadline.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sortline_core::path::DiverterId;
use sortline_core::Direction;
use tokio::time::Instant;

#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    #[error("diverter {0} hardware fault: {1}")]
    Hardware(DiverterId, String),
    #[error("motion controller unavailable: {0}")]
    Unavailable(String),
}

/// A live diverter.
#[async_trait]
pub trait DiverterController: Send + Sync {
    fn diverter_id(&self) -> DiverterId;

    /// Move to `direction`. `Ok(false)` means the command was refused or
    /// did not take effect. The caller enforces `deadline`; implementations
    /// may use it to abandon early.
    async fn actuate(&self, direction: Direction, deadline: Instant) -> Result<bool, DriverError>;
}

/// Resolves diverter ids to controllers.
pub trait DiverterLookup: Send + Sync {
    fn by_id(&self, diverter_id: DiverterId) -> Option<Arc<dyn DiverterController>>;
}

/// The diverter table: shared between the driver layer and the executor.
#[derive(Clone, Default)]
pub struct DiverterTable {
    controllers: Arc<DashMap<DiverterId, Arc<dyn DiverterController>>>,
}

impl DiverterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controller: Arc<dyn DiverterController>) {
        let id = controller.diverter_id();
        if self.controllers.insert(id, controller).is_some() {
            tracing::debug!(diverter_id = id, "diverter controller replaced");
        }
    }

    pub fn unregister(&self, diverter_id: DiverterId) {
        self.controllers.remove(&diverter_id);
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

impl DiverterLookup for DiverterTable {
    fn by_id(&self, diverter_id: DiverterId) -> Option<Arc<dyn DiverterController>> {
        self.controllers.get(&diverter_id).map(|c| c.value().clone())
    }
}
