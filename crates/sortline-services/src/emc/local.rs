use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use sortline_core::{CardNo, LockEvent};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use super::{EmcLockTransport, LockError};

/// In-process rendezvous for instances sharing a card.
///
/// Lock ownership is per card. Broadcasts go to every attached instance
/// (each filters its own events). Acks are routed by event id to the
/// initiator waiting on them.
#[derive(Clone)]
pub struct LocalLockHub {
    owners: Arc<DashMap<CardNo, String>>,
    released: Arc<Notify>,
    events: broadcast::Sender<LockEvent>,
    acks: Arc<DashMap<String, mpsc::UnboundedSender<String>>>,
    members: Arc<DashSet<String>>,
}

impl LocalLockHub {
    pub fn new() -> Self {
        Self {
            owners: Arc::new(DashMap::new()),
            released: Arc::new(Notify::new()),
            events: broadcast::channel(256).0,
            acks: Arc::new(DashMap::new()),
            members: Arc::new(DashSet::new()),
        }
    }

    /// Attach an instance and get its transport handle.
    pub fn attach(&self, instance_id: impl Into<String>) -> LocalLockTransport {
        let instance_id = instance_id.into();
        self.members.insert(instance_id.clone());
        LocalLockTransport {
            hub: self.clone(),
            instance_id,
        }
    }

    pub fn owner(&self, card_no: CardNo) -> Option<String> {
        self.owners.get(&card_no).map(|o| o.clone())
    }

    fn try_acquire(&self, card_no: CardNo, instance_id: &str) -> bool {
        let owner = self
            .owners
            .entry(card_no)
            .or_insert_with(|| instance_id.to_string());
        owner.as_str() == instance_id
    }
}

impl Default for LocalLockHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct LocalLockTransport {
    hub: LocalLockHub,
    instance_id: String,
}

impl LocalLockTransport {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn peer_count(&self) -> usize {
        self.hub
            .members
            .iter()
            .filter(|m| m.as_str() != self.instance_id)
            .count()
    }
}

#[async_trait]
impl EmcLockTransport for LocalLockTransport {
    async fn request_lock(&self, card_no: CardNo, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.hub.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.hub.try_acquire(card_no, &self.instance_id) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(LockError::Timeout { card_no, timeout });
            }
        }
    }

    async fn release_lock(&self, card_no: CardNo) -> Result<(), LockError> {
        match self.hub.owners.remove_if(&card_no, |_, owner| *owner == self.instance_id) {
            Some(_) => {
                self.hub.released.notify_waiters();
                Ok(())
            }
            None => Err(LockError::NotHeld(card_no)),
        }
    }

    async fn broadcast(&self, event: &LockEvent) -> Result<(), LockError> {
        // No receivers is not an error: there may be no peers.
        let _ = self.hub.events.send(event.clone());
        Ok(())
    }

    async fn broadcast_and_await_acks(&self, event: &LockEvent, timeout: Duration) -> Result<(), LockError> {
        let expected = self.peer_count();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.hub.acks.insert(event.event_id.clone(), tx);
        let _ = self.hub.events.send(event.clone());

        let mut ready = HashSet::new();
        let deadline = Instant::now() + timeout;
        while ready.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(peer)) => {
                    ready.insert(peer);
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.hub.acks.remove(&event.event_id);

        if ready.len() < expected {
            return Err(LockError::AckTimeout {
                missing: expected - ready.len(),
                timeout,
            });
        }
        Ok(())
    }

    async fn send_ready(&self, reply: &LockEvent) -> Result<(), LockError> {
        match self.hub.acks.get(&reply.event_id) {
            Some(waiter) => {
                let _ = waiter.send(reply.instance_id.clone());
            }
            None => tracing::debug!(event_id = %reply.event_id, "late ready ack dropped"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.hub.events.subscribe()
    }
}
