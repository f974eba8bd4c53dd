use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sortline_core::config::EmcConfig;
use sortline_core::{CardNo, LockEvent, LockEventKind};

use super::{EmcHardware, EmcLockTransport, HardwareError, LockError, ResetKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResetError {
    /// Nothing was done to the hardware.
    #[error("reset aborted: {0}")]
    Lock(#[from] LockError),
    /// Lock released, no completion sent.
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

/// Initiator side of the reset protocol.
///
/// acquire lock → announce intent and collect acks → grace period →
/// reset → announce completion → release. The lock is released on every
/// path that acquired it, including a panic inside the locked section.
pub struct EmcResetCoordinator {
    card_no: CardNo,
    instance_id: String,
    transport: Arc<dyn EmcLockTransport>,
    hardware: Arc<dyn EmcHardware>,
    lock_timeout: Duration,
    ack_timeout: Duration,
}

impl EmcResetCoordinator {
    pub fn new(config: &EmcConfig, transport: Arc<dyn EmcLockTransport>, hardware: Arc<dyn EmcHardware>) -> Self {
        Self {
            card_no: config.card_no,
            instance_id: config.instance_id.clone(),
            transport,
            hardware,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        }
    }

    pub fn card_no(&self) -> CardNo {
        self.card_no
    }

    pub async fn reset(&self, kind: ResetKind) -> Result<(), ResetError> {
        let card_no = self.card_no;
        if let Err(e) = self.transport.request_lock(card_no, self.lock_timeout).await {
            tracing::error!(card_no, ?kind, error = %e, "reset aborted, lock not acquired");
            return Err(e.into());
        }
        tracing::info!(card_no, ?kind, "card lock acquired");
        let held = HeldLock {
            card_no,
            transport: Some(self.transport.clone()),
        };

        let outcome = AssertUnwindSafe(self.locked_reset(kind)).catch_unwind().await;
        held.release().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn locked_reset(&self, kind: ResetKind) -> Result<(), ResetError> {
        let card_no = self.card_no;

        let lock_notice = LockEvent::new(card_no, &self.instance_id, LockEventKind::RequestLock, "lock held for reset");
        if let Err(e) = self.transport.broadcast(&lock_notice).await {
            tracing::debug!(card_no, error = %e, "lock notice not delivered");
        }

        let intent = LockEvent::new(card_no, &self.instance_id, kind.event_kind(), format!("{kind:?} reset starting"));
        match self.transport.broadcast_and_await_acks(&intent, self.ack_timeout).await {
            Ok(()) => tracing::info!(card_no, event_id = %intent.event_id, "peers ready"),
            Err(e) => tracing::warn!(
                card_no,
                event_id = %intent.event_id,
                error = %e,
                "peers did not all acknowledge; resetting anyway"
            ),
        }

        tokio::time::sleep(kind.grace_period()).await;

        let reset = match kind {
            ResetKind::Cold => self.hardware.cold_reset(card_no).await,
            ResetKind::Hot => self.hardware.hot_reset(card_no).await,
        };
        if let Err(e) = reset {
            tracing::error!(card_no, ?kind, error = %e, "hardware reset failed");
            return Err(e.into());
        }

        let complete = LockEvent::new(card_no, &self.instance_id, LockEventKind::ResetComplete, format!("{kind:?} reset complete"));
        if let Err(e) = self.transport.broadcast(&complete).await {
            tracing::warn!(card_no, error = %e, "reset-complete notice not delivered");
        }
        tracing::info!(card_no, ?kind, "card reset complete");
        Ok(())
    }
}

/// An acquired card lock. Released explicitly on the normal path; if the
/// reset future is dropped first, the release is spawned onto the runtime.
struct HeldLock {
    card_no: CardNo,
    transport: Option<Arc<dyn EmcLockTransport>>,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(transport) = self.transport.take() {
            release(transport.as_ref(), self.card_no).await;
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        let card_no = self.card_no;
        tracing::warn!(card_no, "reset abandoned while holding the card lock");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { release(transport.as_ref(), card_no).await });
            }
            Err(_) => tracing::error!(card_no, "no runtime to release the card lock"),
        }
    }
}

async fn release(transport: &dyn EmcLockTransport, card_no: CardNo) {
    match transport.release_lock(card_no).await {
        Ok(()) => tracing::debug!(card_no, "card lock released"),
        Err(e) => tracing::warn!(card_no, error = %e, "card lock release failed"),
    }
}
