use std::sync::Arc;
use std::time::Duration;

use sortline_core::config::EmcConfig;
use sortline_core::{CardNo, LockEvent, LockEventKind};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::EmcLockTransport;

/// Whether the driver layer may use the card right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardAvailability {
    Available,
    /// Another instance is resetting the card.
    Suspended { by: String, kind: LockEventKind },
}

impl CardAvailability {
    pub fn is_available(&self) -> bool {
        matches!(self, CardAvailability::Available)
    }
}

/// Peer side of the reset protocol.
///
/// Subscribes at construction, so nothing broadcast after `new` returns
/// is missed. Events for other cards and our own events are ignored.
pub struct EmcPeer {
    card_no: CardNo,
    instance_id: String,
    transport: Arc<dyn EmcLockTransport>,
    events: broadcast::Receiver<LockEvent>,
    state: watch::Sender<CardAvailability>,
    /// `None` waits for `ResetComplete` indefinitely.
    resume_timeout: Option<Duration>,
}

impl EmcPeer {
    pub fn new(config: &EmcConfig, transport: Arc<dyn EmcLockTransport>) -> Self {
        let (state, _) = watch::channel(CardAvailability::Available);
        let resume_timeout = (config.peer_resume_timeout_ms > 0)
            .then(|| Duration::from_millis(config.peer_resume_timeout_ms));
        Self {
            card_no: config.card_no,
            instance_id: config.instance_id.clone(),
            events: transport.subscribe(),
            transport,
            state,
            resume_timeout,
        }
    }

    pub fn availability(&self) -> watch::Receiver<CardAvailability> {
        self.state.subscribe()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut resume_at: Option<Instant> = None;
        loop {
            let expiry = async move {
                match resume_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = expiry => {
                    tracing::warn!(card_no = self.card_no, "no reset-complete received; resuming card use");
                    self.state.send_replace(CardAvailability::Available);
                    resume_at = None;
                }
                received = self.events.recv() => match received {
                    Ok(event) => {
                        if let Some(next) = self.on_event(event).await {
                            resume_at = next;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(card_no = self.card_no, skipped, "emc peer lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!(card_no = self.card_no, "emc peer stopped");
    }

    /// Apply one event. Returns the new resume deadline when it changes.
    async fn on_event(&self, event: LockEvent) -> Option<Option<Instant>> {
        if event.card_no != self.card_no || event.instance_id == self.instance_id {
            return None;
        }

        match event.kind {
            LockEventKind::ColdReset | LockEventKind::HotReset => {
                tracing::info!(
                    card_no = self.card_no,
                    from = %event.instance_id,
                    kind = ?event.kind,
                    "peer reset announced; suspending card use"
                );
                self.state.send_replace(CardAvailability::Suspended {
                    by: event.instance_id.clone(),
                    kind: event.kind,
                });
                let reply = event.ready_reply(&self.instance_id);
                if let Err(e) = self.transport.send_ready(&reply).await {
                    tracing::warn!(card_no = self.card_no, error = %e, "ready ack not sent");
                }
                Some(self.resume_timeout.map(|t| Instant::now() + t))
            }
            LockEventKind::ResetComplete => {
                tracing::info!(card_no = self.card_no, from = %event.instance_id, "peer reset complete; resuming");
                self.state.send_replace(CardAvailability::Available);
                Some(None)
            }
            LockEventKind::RequestLock => {
                tracing::debug!(card_no = self.card_no, from = %event.instance_id, "peer holds card lock");
                None
            }
            LockEventKind::Ready => None,
        }
    }
}
