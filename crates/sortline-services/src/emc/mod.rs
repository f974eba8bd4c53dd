//! EMC reset coordination.
//!
//! Several instances may share one motion-control card. A reset is
//! guarded by a named cross-process lock and announced to peers, who
//! stop using the card, acknowledge, and resume when told the reset is
//! complete. The protocol is transport-agnostic; `LocalLockHub` is the
//! in-process transport, the daemon provides a file-lock + UDP one.

mod coordinator;
mod local;
mod peer;

use std::time::Duration;

use async_trait::async_trait;
use sortline_core::{CardNo, LockEvent, LockEventKind};
use tokio::sync::broadcast;

pub use coordinator::{EmcResetCoordinator, ResetError};
pub use local::{LocalLockHub, LocalLockTransport};
pub use peer::{CardAvailability, EmcPeer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Cold,
    Hot,
}

impl ResetKind {
    /// How long peers get to quiesce after the reset is announced.
    pub fn grace_period(self) -> Duration {
        match self {
            ResetKind::Cold => Duration::from_millis(1_000),
            ResetKind::Hot => Duration::from_millis(500),
        }
    }

    pub fn event_kind(self) -> LockEventKind {
        match self {
            ResetKind::Cold => LockEventKind::ColdReset,
            ResetKind::Hot => LockEventKind::HotReset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("card {card_no} lock not acquired within {timeout:?}")]
    Timeout { card_no: CardNo, timeout: Duration },
    #[error("card {0} lock is not held by this instance")]
    NotHeld(CardNo),
    #[error("{missing} peer(s) did not acknowledge within {timeout:?}")]
    AckTimeout { missing: usize, timeout: Duration },
    #[error("lock transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("card {card_no} reset failed: {message}")]
pub struct HardwareError {
    pub card_no: CardNo,
    pub message: String,
}

/// Named lock plus notification channel shared by instances of one card.
#[async_trait]
pub trait EmcLockTransport: Send + Sync {
    /// Wait at most `timeout` for exclusive ownership of the card lock.
    async fn request_lock(&self, card_no: CardNo, timeout: Duration) -> Result<(), LockError>;

    async fn release_lock(&self, card_no: CardNo) -> Result<(), LockError>;

    /// Fire-and-forget broadcast to every peer.
    async fn broadcast(&self, event: &LockEvent) -> Result<(), LockError>;

    /// Broadcast and wait until every known peer has answered with a
    /// `Ready` carrying `event.event_id`.
    async fn broadcast_and_await_acks(&self, event: &LockEvent, timeout: Duration) -> Result<(), LockError>;

    /// Send a `Ready` acknowledgment back to the initiator.
    async fn send_ready(&self, reply: &LockEvent) -> Result<(), LockError>;

    /// Events from other instances, in arrival order.
    fn subscribe(&self) -> broadcast::Receiver<LockEvent>;
}

#[async_trait]
pub trait EmcHardware: Send + Sync {
    async fn cold_reset(&self, card_no: CardNo) -> Result<(), HardwareError>;
    async fn hot_reset(&self, card_no: CardNo) -> Result<(), HardwareError>;
}
