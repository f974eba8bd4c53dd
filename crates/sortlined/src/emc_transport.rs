//! Cross-process EMC transport.
//!
//! The card lock is `flock(2)` on `<lock_dir>/sortline-emc-<card>.lock`,
//! polled with `LOCK_NB` until the caller's deadline. Notifications are
//! JSON `LockEvent` datagrams sent to every configured peer; `Ready`
//! replies are routed by event id to the waiting initiator.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use sortline_core::config::EmcConfig;
use sortline_core::{CardNo, LockEvent, LockEventKind};
use sortline_services::{EmcLockTransport, LockError};

const LOCK_POLL: Duration = Duration::from_millis(50);

pub struct FileLockTransport {
    instance_id: String,
    lock_dir: PathBuf,
    held: Mutex<HashMap<CardNo, File>>,
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
    events: broadcast::Sender<LockEvent>,
    acks: DashMap<String, mpsc::UnboundedSender<String>>,
}

impl FileLockTransport {
    pub fn bind(config: &EmcConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.lock_dir)
            .with_context(|| format!("failed to create lock dir {}", config.lock_dir.display()))?;

        let socket = make_socket(config.listen_port).context("failed to create emc socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        tracing::info!(
            addr = %socket.local_addr()?,
            peers = config.peers.len(),
            lock_dir = %config.lock_dir.display(),
            "emc transport bound"
        );

        Ok(Self {
            instance_id: config.instance_id.clone(),
            lock_dir: config.lock_dir.clone(),
            held: Mutex::new(HashMap::new()),
            socket,
            peers: config.peers.clone(),
            events: broadcast::channel(64).0,
            acks: DashMap::new(),
        })
    }

    fn lock_path(&self, card_no: CardNo) -> PathBuf {
        self.lock_dir.join(format!("sortline-emc-{card_no}.lock"))
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<CardNo, File>> {
        match self.held.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Receive peer datagrams until shutdown.
    pub async fn receive_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.recv() => break,
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "emc recv_from failed");
                        continue;
                    }
                },
            };

            let event = match LockEvent::from_bytes(&buf[..len]) {
                Ok(event) => event,
                Err(e) => {
                    tracing::trace!(%from, error = %e, "ignoring malformed emc datagram");
                    continue;
                }
            };
            if event.instance_id == self.instance_id {
                continue;
            }

            if event.kind == LockEventKind::Ready {
                if let Some(waiter) = self.acks.get(&event.event_id) {
                    let _ = waiter.send(event.instance_id.clone());
                }
                continue;
            }

            tracing::debug!(%from, kind = ?event.kind, card_no = event.card_no, "emc event received");
            let _ = self.events.send(event);
        }
        tracing::debug!("emc receive loop stopped");
    }

    async fn send_all(&self, event: &LockEvent) -> Result<(), LockError> {
        let bytes = event
            .to_bytes()
            .map_err(|e| LockError::Transport(format!("encode: {e}")))?;
        let mut delivered = 0;
        for peer in &self.peers {
            match self.socket.send_to(&bytes, peer).await {
                Ok(_) => delivered += 1,
                Err(e) => tracing::warn!(%peer, error = %e, "emc send failed"),
            }
        }
        if delivered == 0 && !self.peers.is_empty() {
            return Err(LockError::Transport("no peer reachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EmcLockTransport for FileLockTransport {
    async fn request_lock(&self, card_no: CardNo, timeout: Duration) -> Result<(), LockError> {
        if self.held().contains_key(&card_no) {
            return Ok(());
        }

        let path = self.lock_path(card_no);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::Transport(format!("open {}: {e}", path.display())))?;

        let deadline = Instant::now() + timeout;
        loop {
            // SAFETY: fd is owned by `file`, which outlives this call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc == 0 {
                self.held().insert(card_no, file);
                return Ok(());
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(LockError::Transport(format!("flock {}: {err}", path.display())));
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout { card_no, timeout });
            }
            tokio::time::sleep(LOCK_POLL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn release_lock(&self, card_no: CardNo) -> Result<(), LockError> {
        let file = self.held().remove(&card_no).ok_or(LockError::NotHeld(card_no))?;
        // SAFETY: as above; closing the file would also drop the lock.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return Err(LockError::Transport(format!("unlock card {card_no}: {err}")));
        }
        Ok(())
    }

    async fn broadcast(&self, event: &LockEvent) -> Result<(), LockError> {
        self.send_all(event).await
    }

    async fn broadcast_and_await_acks(&self, event: &LockEvent, timeout: Duration) -> Result<(), LockError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.acks.insert(event.event_id.clone(), tx);

        let sent = self.send_all(event).await;
        let mut ready = HashSet::new();
        if sent.is_ok() {
            let deadline = Instant::now() + timeout;
            while ready.len() < self.peers.len() {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(peer)) => {
                        ready.insert(peer);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
        self.acks.remove(&event.event_id);
        sent?;

        if ready.len() < self.peers.len() {
            return Err(LockError::AckTimeout {
                missing: self.peers.len() - ready.len(),
                timeout,
            });
        }
        Ok(())
    }

    async fn send_ready(&self, reply: &LockEvent) -> Result<(), LockError> {
        self.send_all(reply).await
    }

    fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }
}

fn make_socket(port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into()).context("bind()")?;
    Ok(socket.into())
}
