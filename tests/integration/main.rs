//! sortline integration tests.
//!
//! Everything runs in-process against scripted collaborators: diverters
//! with fixed latency and outcome, an upstream client whose assignments
//! are fed back through `PendingAssignments`, and the in-process EMC hub.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use sortline_core::config::SortlineConfig;
use sortline_core::{ChuteId, Direction, DiverterId, ParcelId};
use sortline_services::{
    Collaborators, CongestionSource, DiverterController, DiverterTable, DriverError, LineLoadCollector, MemoryTraceSink,
    NodeHealthRegistry, PendingAssignments, SortingOrchestrator, TopologyPathGenerator, UpstreamClient,
    UpstreamError, UpstreamLink,
};

mod emc;
mod pipeline;
mod selection;

// ── Harness ───────────────────────────────────────────────────────────────────

/// What a scripted diverter does when actuated.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    Succeed,
    Refuse,
    Hang,
}

pub struct ScriptedDiverter {
    id: DiverterId,
    latency: Duration,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedDiverter {
    pub fn new(id: DiverterId, latency_ms: u64, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            id,
            latency: Duration::from_millis(latency_ms),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiverterController for ScriptedDiverter {
    fn diverter_id(&self) -> DiverterId {
        self.id
    }

    async fn actuate(&self, _direction: Direction, _deadline: Instant) -> Result<bool, DriverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviour {
            Behaviour::Succeed => {
                tokio::time::sleep(self.latency).await;
                Ok(true)
            }
            Behaviour::Refuse => Ok(false),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(true)
            }
        }
    }
}

/// Upstream that records notifications and answers from a script.
#[derive(Default)]
pub struct ScriptedUpstream {
    pub disconnected: bool,
    pub answers: Mutex<HashMap<ParcelId, (ChuteId, Duration)>>,
    pub notified: Mutex<Vec<ParcelId>>,
    pub pending: PendingAssignments,
}

impl ScriptedUpstream {
    pub fn answering(pending: PendingAssignments, answers: &[(ParcelId, ChuteId, u64)]) -> Arc<Self> {
        let answers = answers
            .iter()
            .map(|&(p, c, ms)| (p, (c, Duration::from_millis(ms))))
            .collect();
        Arc::new(Self {
            answers: Mutex::new(answers),
            pending,
            ..Self::default()
        })
    }

    pub fn notified(&self) -> Vec<ParcelId> {
        self.notified.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    fn is_connected(&self) -> bool {
        !self.disconnected
    }

    async fn notify_parcel_detected(&self, parcel_id: ParcelId) -> Result<bool, UpstreamError> {
        self.notified.lock().unwrap().push(parcel_id);
        let answer = self.answers.lock().unwrap().remove(&parcel_id);
        if let Some((chute_id, delay)) = answer {
            let pending = self.pending.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                pending.resolve(parcel_id, chute_id);
            });
        }
        Ok(true)
    }
}

/// A wired orchestrator plus handles to inspect it.
pub struct Line {
    pub orchestrator: Arc<SortingOrchestrator>,
    pub load: Arc<LineLoadCollector>,
    pub health: NodeHealthRegistry,
    pub traces: Arc<MemoryTraceSink>,
}

pub fn line(config: &SortlineConfig, diverters: &[Arc<ScriptedDiverter>], upstream: Option<Arc<ScriptedUpstream>>) -> Line {
    line_with_congestion(config, diverters, upstream, None)
}

/// Like `line`, but overload decisions read `congestion` instead of the
/// line's own load collector.
pub fn line_with_congestion(
    config: &SortlineConfig,
    diverters: &[Arc<ScriptedDiverter>],
    upstream: Option<Arc<ScriptedUpstream>>,
    congestion: Option<Arc<dyn CongestionSource>>,
) -> Line {
    let table = DiverterTable::new();
    for d in diverters {
        table.register(d.clone());
    }
    let load = Arc::new(LineLoadCollector::new(config.congestion.window));
    let health = NodeHealthRegistry::new();
    let traces = Arc::new(MemoryTraceSink::new(1_024));
    let congestion: Arc<dyn CongestionSource> = match congestion {
        Some(source) => source,
        None => load.clone(),
    };

    let upstream = upstream.map(|u| UpstreamLink {
        pending: u.pending.clone(),
        client: u,
    });
    let orchestrator = Arc::new(SortingOrchestrator::new(
        config,
        Collaborators {
            paths: Arc::new(TopologyPathGenerator::new(&config.topology, config.line.exception_chute_id)),
            diverters: Arc::new(table),
            health: Arc::new(health.clone()),
            congestion,
            metrics: load.clone(),
            trace_sink: traces.clone(),
            upstream,
        },
    ));

    Line {
        orchestrator,
        load,
        health,
        traces,
    }
}

/// Diverters 1 and 2 of the default topology, both healthy and fast.
pub fn healthy_diverters() -> Vec<Arc<ScriptedDiverter>> {
    vec![
        ScriptedDiverter::new(1, 10, Behaviour::Succeed),
        ScriptedDiverter::new(2, 10, Behaviour::Succeed),
    ]
}
