//! Formal mode: the upstream routing service picks the chute.
//!
//! The parcel is registered in `PendingAssignments` before the upstream is
//! notified, then the strategy waits for whichever comes first: a matching
//! assignment, the response timeout, or cancellation. Registrations are
//! removed exactly once. The timeout path and the resolver both go through
//! a token-checked remove, so a late assignment can never resolve a wait
//! that has already given up, and a wait that lost the race still picks up
//! the chute the resolver delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sortline_core::{ChuteId, ParcelId};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{ChuteSelectionStrategy, FallbackCause, SelectionRequest, SelectionResult};
use crate::upstream::UpstreamClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    /// No wait registered for this parcel. Nothing happened.
    NotFound,
}

struct Pending {
    token: u64,
    tx: oneshot::Sender<ChuteId>,
}

/// Parcel id → single-assignment future. Shared with the upstream event bridge.
#[derive(Clone, Default)]
pub struct PendingAssignments {
    waits: Arc<DashMap<ParcelId, Pending>>,
    next_token: Arc<AtomicU64>,
}

/// Handle held by the waiting side of a registration. Dropping it removes
/// the entry if it is still this registration's.
pub struct Registration {
    parcel_id: ParcelId,
    token: u64,
    rx: oneshot::Receiver<ChuteId>,
    waits: Arc<DashMap<ParcelId, Pending>>,
}

impl Registration {
    /// Remove this registration's own entry. False if someone else removed it first.
    fn withdraw(&self) -> bool {
        self.waits
            .remove_if(&self.parcel_id, |_, p| p.token == self.token)
            .is_some()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.withdraw() {
            tracing::debug!(parcel_id = self.parcel_id, "abandoned pending assignment removed");
        }
    }
}

impl PendingAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait. A second registration for the same parcel replaces
    /// the first; the replaced waiter observes a closed channel.
    pub fn register(&self, parcel_id: ParcelId) -> Registration {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if self.waits.insert(parcel_id, Pending { token, tx }).is_some() {
            tracing::warn!(parcel_id, "replaced an existing pending assignment");
        }
        Registration {
            parcel_id,
            token,
            rx,
            waits: self.waits.clone(),
        }
    }

    /// Deliver an upstream assignment. No-op (`NotFound`) when nothing waits.
    pub fn resolve(&self, parcel_id: ParcelId, chute_id: ChuteId) -> ResolveOutcome {
        match self.waits.remove(&parcel_id) {
            Some((_, pending)) => {
                if pending.tx.send(chute_id).is_err() {
                    tracing::debug!(parcel_id, "assignment arrived for an abandoned wait");
                }
                ResolveOutcome::Resolved
            }
            None => {
                tracing::debug!(parcel_id, chute_id, "no pending wait for assignment");
                ResolveOutcome::NotFound
            }
        }
    }

    pub fn contains(&self, parcel_id: ParcelId) -> bool {
        self.waits.contains_key(&parcel_id)
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

enum WaitEnd {
    Assigned(ChuteId),
    Superseded,
    TimedOut,
    Cancelled,
}

pub struct FormalChuteStrategy {
    upstream: Arc<dyn UpstreamClient>,
    pending: PendingAssignments,
    response_timeout: Duration,
}

impl FormalChuteStrategy {
    pub fn new(upstream: Arc<dyn UpstreamClient>, pending: PendingAssignments, response_timeout: Duration) -> Self {
        Self {
            upstream,
            pending,
            response_timeout,
        }
    }

    pub fn pending(&self) -> &PendingAssignments {
        &self.pending
    }

    async fn wait(&self, mut reg: Registration, cancel: &CancellationToken) -> WaitEnd {
        let stopped = tokio::select! {
            biased;
            r = &mut reg.rx => {
                return match r {
                    Ok(chute) => WaitEnd::Assigned(chute),
                    Err(_) => WaitEnd::Superseded,
                };
            }
            _ = cancel.cancelled() => WaitEnd::Cancelled,
            _ = tokio::time::sleep(self.response_timeout) => WaitEnd::TimedOut,
        };

        if reg.withdraw() {
            return stopped;
        }

        // The resolver removed the entry first; its value is already in flight.
        match (&mut reg.rx).await {
            Ok(chute) => WaitEnd::Assigned(chute),
            Err(_) => stopped,
        }
    }
}

#[async_trait]
impl ChuteSelectionStrategy for FormalChuteStrategy {
    async fn select(&self, req: &SelectionRequest, cancel: &CancellationToken) -> SelectionResult {
        if let Some(forced) = SelectionResult::overload_forced(req) {
            return forced;
        }

        if !self.upstream.is_connected() {
            return SelectionResult::exception(
                req,
                FallbackCause::UpstreamNotConnected,
                "upstream not connected",
            );
        }

        let reg = self.pending.register(req.parcel_id);

        let notified = match self.upstream.notify_parcel_detected(req.parcel_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err("upstream rejected parcel notification".to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(detail) = notified {
            reg.withdraw();
            tracing::warn!(parcel_id = req.parcel_id, error = %detail, "parcel notify failed");
            return SelectionResult::exception(
                req,
                FallbackCause::NotifyFailed,
                format!("notify failed: {detail}"),
            );
        }

        match self.wait(reg, cancel).await {
            WaitEnd::Assigned(chute) => {
                tracing::debug!(parcel_id = req.parcel_id, chute_id = chute, "upstream assigned chute");
                SelectionResult::chute(chute, "assigned by upstream")
            }
            WaitEnd::TimedOut => {
                tracing::warn!(
                    parcel_id = req.parcel_id,
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "upstream assignment timed out"
                );
                SelectionResult::exception(
                    req,
                    FallbackCause::UpstreamTimeout,
                    format!(
                        "upstream assignment timed out after {} ms",
                        self.response_timeout.as_millis()
                    ),
                )
            }
            WaitEnd::Cancelled => SelectionResult::exception(
                req,
                FallbackCause::Cancelled,
                "upstream wait cancelled",
            ),
            WaitEnd::Superseded => SelectionResult::exception(
                req,
                FallbackCause::Cancelled,
                "upstream wait superseded by a newer registration",
            ),
        }
    }
}
