//! Throttled infeed. Releases simulated parcels onto the line, spacing
//! them by the release throttle's interval for the current congestion
//! level, and runs each one through the orchestrator concurrently.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;

use sortline_core::ParcelIdGenerator;
use sortline_services::{CongestionDetector, CongestionSource, ReleaseThrottle, SortingOrchestrator};

pub struct Infeed {
    orchestrator: Arc<SortingOrchestrator>,
    throttle: ReleaseThrottle,
    detector: CongestionDetector,
    congestion: Arc<dyn CongestionSource>,
    ids: ParcelIdGenerator,
    shutdown: broadcast::Receiver<()>,
}

impl Infeed {
    pub fn new(
        orchestrator: Arc<SortingOrchestrator>,
        throttle: ReleaseThrottle,
        detector: CongestionDetector,
        congestion: Arc<dyn CongestionSource>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            orchestrator,
            throttle,
            detector,
            congestion,
            ids: ParcelIdGenerator::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut parcels = JoinSet::new();
        let mut next_release = Instant::now();
        let mut held = false;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                Some(joined) = parcels.join_next(), if !parcels.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "parcel task failed");
                    }
                }
                _ = tokio::time::sleep_until(next_release) => {
                    let level = self.detector.detect(&self.congestion.collect());
                    let decision = self.throttle.decide(level);
                    if decision.allow {
                        if held {
                            tracing::info!(%level, "releases resumed");
                            held = false;
                        }
                        let parcel_id = self.ids.next_id();
                        let orchestrator = self.orchestrator.clone();
                        parcels.spawn(async move {
                            orchestrator.handle_parcel_detected(parcel_id, None).await
                        });
                    } else if !held {
                        tracing::warn!(%level, "releases paused");
                        held = true;
                    }
                    next_release = Instant::now() + decision.interval;
                }
            }
        }

        self.orchestrator.shutdown();
        let draining = parcels.len();
        while let Some(joined) = parcels.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "parcel task failed");
            }
        }
        tracing::info!(drained = draining, "infeed stopped");
    }
}
