//! Simulated hardware and upstream routing service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use sortline_core::{CardNo, ChuteId, Direction, DiverterId, ParcelId};
use sortline_services::{
    CardAvailability, ChuteAssignment, DiverterController, DriverError, EmcHardware, HardwareError, UpstreamClient,
    UpstreamError,
};

/// Diverter with fixed actuation latency and optional random failures.
/// Refuses to move while the shared card is being reset.
pub struct SimulatedDiverter {
    id: DiverterId,
    latency: Duration,
    failure_rate: f64,
    card: watch::Receiver<CardAvailability>,
}

impl SimulatedDiverter {
    pub fn new(id: DiverterId, latency: Duration, failure_rate: f64, card: watch::Receiver<CardAvailability>) -> Self {
        Self {
            id,
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            card,
        }
    }
}

#[async_trait]
impl DiverterController for SimulatedDiverter {
    fn diverter_id(&self) -> DiverterId {
        self.id
    }

    async fn actuate(&self, direction: Direction, _deadline: Instant) -> Result<bool, DriverError> {
        if let CardAvailability::Suspended { by, .. } = &*self.card.borrow() {
            return Err(DriverError::Unavailable(format!("card reset in progress by {by}")));
        }
        let failed = rand::thread_rng().gen_bool(self.failure_rate);
        tokio::time::sleep(self.latency).await;
        tracing::trace!(diverter_id = self.id, %direction, failed, "diverter actuated");
        Ok(!failed)
    }
}

/// Routing service that answers every notification with a random chute
/// after a fixed delay.
pub struct SimulatedUpstream {
    connected: AtomicBool,
    chutes: Vec<ChuteId>,
    delay: Duration,
    assignments: mpsc::UnboundedSender<ChuteAssignment>,
}

impl SimulatedUpstream {
    pub fn new(chutes: Vec<ChuteId>, delay: Duration, assignments: mpsc::UnboundedSender<ChuteAssignment>) -> Self {
        Self {
            connected: AtomicBool::new(true),
            chutes,
            delay,
            assignments,
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

#[async_trait]
impl UpstreamClient for SimulatedUpstream {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn notify_parcel_detected(&self, parcel_id: ParcelId) -> Result<bool, UpstreamError> {
        if !self.is_connected() {
            return Err(UpstreamError::NotConnected);
        }
        let Some(&chute_id) = self.chutes.choose(&mut rand::thread_rng()) else {
            return Ok(false);
        };

        let tx = self.assignments.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ChuteAssignment { parcel_id, chute_id });
        });
        Ok(true)
    }
}

/// Motion-control card stand-in.
pub struct SimulatedCard;

#[async_trait]
impl EmcHardware for SimulatedCard {
    async fn cold_reset(&self, card_no: CardNo) -> Result<(), HardwareError> {
        tracing::info!(card_no, "cold resetting card");
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn hot_reset(&self, card_no: CardNo) -> Result<(), HardwareError> {
        tracing::info!(card_no, "hot resetting card");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}
