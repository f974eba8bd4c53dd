use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sortline_core::config::EmcConfig;
use sortline_core::CardNo;
use sortline_services::{
    CardAvailability, EmcHardware, EmcLockTransport, EmcPeer, EmcResetCoordinator, HardwareError, LocalLockHub,
    LockError, ResetError, ResetKind,
};

use crate::*;

#[derive(Default)]
struct CountingCard {
    resets: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl EmcHardware for CountingCard {
    async fn cold_reset(&self, card_no: CardNo) -> Result<(), HardwareError> {
        self.hot_reset(card_no).await
    }

    async fn hot_reset(&self, card_no: CardNo) -> Result<(), HardwareError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.fail {
            return Err(HardwareError {
                card_no,
                message: "card did not come back".into(),
            });
        }
        Ok(())
    }
}

fn emc_config(instance: &str) -> EmcConfig {
    EmcConfig {
        card_no: 1,
        instance_id: instance.into(),
        lock_timeout_ms: 500,
        ack_timeout_ms: 3_000,
        peer_resume_timeout_ms: 0,
        ..EmcConfig::default()
    }
}

/// Records every availability the peer publishes.
fn watch_states(peer: &EmcPeer) -> Arc<Mutex<Vec<bool>>> {
    let mut rx = peer.availability();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let available = rx.borrow_and_update().is_available();
            sink.lock().unwrap().push(available);
        }
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn test_reset_suspends_peer_until_complete() -> Result<()> {
    let hub = LocalLockHub::new();
    let a = Arc::new(hub.attach("line-a"));
    let b = Arc::new(hub.attach("line-b"));

    let peer = EmcPeer::new(&emc_config("line-b"), b);
    let states = watch_states(&peer);
    let stop = CancellationToken::new();
    let peer_task = tokio::spawn(peer.run(stop.clone()));

    let card = Arc::new(CountingCard::default());
    let coordinator = EmcResetCoordinator::new(&emc_config("line-a"), a, card.clone());

    let started = Instant::now();
    coordinator.reset(ResetKind::Hot).await?;

    // acked promptly: grace + reset, well short of the ack timeout
    assert!(started.elapsed() < Duration::from_millis(3_000));
    assert_eq!(card.resets.load(Ordering::SeqCst), 1);
    assert_eq!(hub.owner(1), None, "lock released after reset");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*states.lock().unwrap(), vec![false, true]);

    stop.cancel();
    peer_task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_contended_lock_aborts_without_hardware_action() -> Result<()> {
    let hub = LocalLockHub::new();
    let a = hub.attach("line-a");
    let b = Arc::new(hub.attach("line-b"));

    a.request_lock(1, Duration::from_secs(1)).await?;

    let card = Arc::new(CountingCard::default());
    let coordinator = EmcResetCoordinator::new(&emc_config("line-b"), b, card.clone());
    let err = coordinator.reset(ResetKind::Cold).await.unwrap_err();

    assert!(matches!(err, ResetError::Lock(LockError::Timeout { .. })));
    assert_eq!(card.resets.load(Ordering::SeqCst), 0);
    assert_eq!(hub.owner(1).as_deref(), Some("line-a"), "holder keeps the lock");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resets_serialize_across_instances() -> Result<()> {
    let hub = LocalLockHub::new();
    let card = Arc::new(CountingCard::default());
    let mut config_a = emc_config("line-a");
    let mut config_b = emc_config("line-b");
    config_a.lock_timeout_ms = 10_000;
    config_b.lock_timeout_ms = 10_000;
    // nobody acks: each reset waits out a short ack timeout
    config_a.ack_timeout_ms = 100;
    config_b.ack_timeout_ms = 100;

    let a = EmcResetCoordinator::new(&config_a, Arc::new(hub.attach("line-a")), card.clone());
    let b = EmcResetCoordinator::new(&config_b, Arc::new(hub.attach("line-b")), card.clone());

    let (ra, rb) = tokio::join!(a.reset(ResetKind::Hot), b.reset(ResetKind::Hot));
    ra?;
    rb?;
    assert_eq!(card.resets.load(Ordering::SeqCst), 2);
    assert_eq!(hub.owner(1), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_reset_releases_the_card_lock() -> Result<()> {
    let hub = LocalLockHub::new();
    let a = Arc::new(hub.attach("line-a"));
    let b = Arc::new(hub.attach("line-b"));

    let peer = EmcPeer::new(&emc_config("line-b"), b.clone());
    let stop = CancellationToken::new();
    let peer_task = tokio::spawn(peer.run(stop.clone()));

    let card = Arc::new(CountingCard::default());
    let coordinator = EmcResetCoordinator::new(&emc_config("line-a"), a, card.clone());
    let reset = tokio::spawn(async move { coordinator.reset(ResetKind::Cold).await });

    // acks arrive at once; 300 ms into the 1 s cold grace period
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.owner(1).as_deref(), Some("line-a"));
    reset.abort();
    assert!(reset.await.unwrap_err().is_cancelled());

    b.request_lock(1, Duration::from_secs(1)).await?;
    assert_eq!(hub.owner(1).as_deref(), Some("line-b"));
    assert_eq!(card.resets.load(Ordering::SeqCst), 0);

    stop.cancel();
    peer_task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_reset_leaves_peer_waiting_until_timeout() -> Result<()> {
    let hub = LocalLockHub::new();
    let a = Arc::new(hub.attach("line-a"));
    let b = Arc::new(hub.attach("line-b"));

    let mut peer_config = emc_config("line-b");
    peer_config.peer_resume_timeout_ms = 5_000;
    let peer = EmcPeer::new(&peer_config, b);
    let mut availability = peer.availability();
    let stop = CancellationToken::new();
    let peer_task = tokio::spawn(peer.run(stop.clone()));

    let card = Arc::new(CountingCard {
        fail: true,
        ..CountingCard::default()
    });
    let coordinator = EmcResetCoordinator::new(&emc_config("line-a"), a, card);
    let err = coordinator.reset(ResetKind::Cold).await.unwrap_err();
    assert!(matches!(err, ResetError::Hardware(_)));
    assert_eq!(hub.owner(1), None, "lock released after hardware failure");

    // no ResetComplete was sent
    assert!(matches!(
        *availability.borrow_and_update(),
        CardAvailability::Suspended { .. }
    ));

    tokio::time::sleep(Duration::from_millis(5_000)).await;
    availability.changed().await?;
    assert!(availability.borrow().is_available());

    stop.cancel();
    peer_task.await?;
    Ok(())
}
