//! Periodic line load report.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use sortline_services::{CongestionDetector, CongestionSource, LineLoadCollector, PendingAssignments};

pub async fn report_loop(
    load: Arc<LineLoadCollector>,
    detector: CongestionDetector,
    pending: PendingAssignments,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = interval.tick() => {}
        }

        let snapshot = load.collect();
        let level = detector.detect(&snapshot);
        let totals = load.totals();
        tracing::info!(
            %level,
            in_flight = snapshot.in_flight_parcels,
            avg_latency_ms = format_args!("{:.1}", snapshot.average_latency_ms),
            failure_ratio = format_args!("{:.3}", snapshot.failure_ratio),
            completed = totals.completed,
            failed = totals.failed,
            overloaded = totals.overloaded,
            segment_failures = totals.segment_failures,
            awaiting_upstream = pending.len(),
            "line load"
        );
    }
}
