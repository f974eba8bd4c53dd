//! sortlined: parcel sorting line daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sortline_core::config::SortlineConfig;
use sortline_services::{
    Collaborators, CongestionDetector, DiverterTable, EmcPeer, EmcResetCoordinator, LineLoadCollector,
    NodeHealthRegistry, PendingAssignments, ReleaseThrottle, ResetKind, SortingOrchestrator, TopologyPathGenerator,
    TracingTraceSink, UpstreamLink,
};

mod bridge;
mod emc_transport;
mod infeed;
mod report;
mod sim;

use emc_transport::FileLockTransport;
use sim::{SimulatedCard, SimulatedDiverter, SimulatedUpstream};

const DIVERTER_LATENCY: Duration = Duration::from_millis(20);
const REPORT_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SortlineConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = SortlineConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SortlineConfig::default()
    });
    if config.emc.instance_id.is_empty() {
        config.emc.instance_id = format!("sortlined-{}", std::process::id());
    }
    tracing::info!(
        mode = ?config.line.sorting_mode,
        exception_chute_id = config.line.exception_chute_id,
        instance_id = %config.emc.instance_id,
        "sortlined starting"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let cancel = CancellationToken::new();

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── EMC coordination ─────────────────────────────────────────────────────
    let transport = Arc::new(FileLockTransport::bind(&config.emc).context("failed to start emc transport")?);
    let peer = EmcPeer::new(&config.emc, transport.clone());
    let card = peer.availability();
    let coordinator = Arc::new(EmcResetCoordinator::new(
        &config.emc,
        transport.clone(),
        Arc::new(SimulatedCard),
    ));

    // ── Line hardware ────────────────────────────────────────────────────────
    let diverters = DiverterTable::new();
    let mut diverter_ids: Vec<_> = config
        .topology
        .routes
        .iter()
        .flat_map(|r| r.steps.iter().map(|s| s.diverter_id))
        .collect();
    diverter_ids.sort_unstable();
    diverter_ids.dedup();
    for id in &diverter_ids {
        diverters.register(Arc::new(SimulatedDiverter::new(*id, DIVERTER_LATENCY, 0.0, card.clone())));
    }
    tracing::info!(diverters = ?diverter_ids, "simulated diverters registered");

    let paths = TopologyPathGenerator::new(&config.topology, config.line.exception_chute_id);
    let load = Arc::new(LineLoadCollector::new(config.congestion.window));

    // ── Upstream routing ─────────────────────────────────────────────────────
    let (assign_tx, assign_rx) = mpsc::unbounded_channel();
    let upstream = Arc::new(SimulatedUpstream::new(
        config.line.available_chutes.clone(),
        Duration::from_millis(config.upstream.simulated_delay_ms),
        assign_tx,
    ));
    let pending = PendingAssignments::new();

    let orchestrator = Arc::new(SortingOrchestrator::new(
        &config,
        Collaborators {
            paths: Arc::new(paths),
            diverters: Arc::new(diverters),
            health: Arc::new(NodeHealthRegistry::new()),
            congestion: load.clone(),
            metrics: load.clone(),
            trace_sink: Arc::new(TracingTraceSink),
            upstream: Some(UpstreamLink {
                client: upstream,
                pending: pending.clone(),
            }),
        },
    ));

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let detector = CongestionDetector::new(config.congestion.clone());

    let emc_receiver_task = tokio::spawn(transport.clone().receive_loop(shutdown_tx.subscribe()));
    let emc_peer_task = tokio::spawn(peer.run(cancel.child_token()));
    let bridge_task = tokio::spawn(bridge::bridge_loop(assign_rx, pending.clone(), shutdown_tx.subscribe()));
    let infeed_task = tokio::spawn(
        infeed::Infeed::new(
            orchestrator.clone(),
            ReleaseThrottle::new(config.throttle.clone()),
            detector.clone(),
            load.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );
    let report_task = tokio::spawn(report::report_loop(
        load.clone(),
        detector,
        pending,
        REPORT_PERIOD,
        shutdown_tx.subscribe(),
    ));
    let reset_task = tokio::spawn(reset_signal_loop(coordinator));

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = emc_receiver_task   => tracing::error!("emc receiver exited: {:?}", r),
        r = emc_peer_task       => tracing::error!("emc peer exited: {:?}", r),
        r = bridge_task         => tracing::error!("upstream bridge exited: {:?}", r),
        r = report_task         => tracing::error!("load reporter exited: {:?}", r),
        r = reset_task          => tracing::error!("reset signal handler exited: {:?}", r),
    }

    let _ = shutdown_tx.send(());
    cancel.cancel();
    orchestrator.shutdown();
    if let Err(e) = infeed_task.await {
        tracing::error!(error = %e, "infeed task failed");
    }

    Ok(())
}

/// SIGUSR1 triggers a hot reset of the card, SIGUSR2 a cold one.
async fn reset_signal_loop(coordinator: Arc<EmcResetCoordinator>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hot = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    let mut cold = signal(SignalKind::user_defined2()).context("failed to install SIGUSR2 handler")?;

    loop {
        let kind = tokio::select! {
            Some(()) = hot.recv() => ResetKind::Hot,
            Some(()) = cold.recv() => ResetKind::Cold,
            else => return Ok(()),
        };
        tracing::info!(card_no = coordinator.card_no(), ?kind, "reset requested");
        if let Err(e) = coordinator.reset(kind).await {
            tracing::error!(card_no = coordinator.card_no(), error = %e, "reset failed");
        }
    }
}
