//! EMC lock events: the messages exchanged between instances that share
//! a motion-control card.
//!
//! Events are created by the instance initiating a reset, broadcast to
//! peers, and consumed by each receiver. Nothing is persisted. `Ready`
//! acknowledgments carry the `event_id` of the notification they answer.
//!
//! Wire format (for datagram transports): one JSON object per datagram.

use serde::{Deserialize, Serialize};

use crate::parcel::now_ms;

/// Motion-control card number.
pub type CardNo = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    RequestLock,
    ColdReset,
    HotReset,
    ResetComplete,
    Ready,
}

impl LockEventKind {
    fn tag(self) -> u8 {
        match self {
            LockEventKind::RequestLock => 0,
            LockEventKind::ColdReset => 1,
            LockEventKind::HotReset => 2,
            LockEventKind::ResetComplete => 3,
            LockEventKind::Ready => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub card_no: CardNo,
    /// Instance that produced this event.
    pub instance_id: String,
    pub kind: LockEventKind,
    pub message: String,
    /// Correlation id. For `Ready`, the id of the acknowledged event.
    pub event_id: String,
    /// Unix ms.
    pub timestamp_ms: i64,
}

impl LockEvent {
    /// New event with a fresh id:
    /// `hex(blake3(instance_id || card_no_le || kind || timestamp_le))[..32]`.
    pub fn new(
        card_no: CardNo,
        instance_id: impl Into<String>,
        kind: LockEventKind,
        message: impl Into<String>,
    ) -> Self {
        let instance_id = instance_id.into();
        let timestamp_ms = now_ms();
        let event_id = event_id(&instance_id, card_no, kind, timestamp_ms);
        Self {
            card_no,
            instance_id,
            kind,
            message: message.into(),
            event_id,
            timestamp_ms,
        }
    }

    /// Ready acknowledgment from `instance_id` for this event.
    pub fn ready_reply(&self, instance_id: impl Into<String>) -> Self {
        Self {
            card_no: self.card_no,
            instance_id: instance_id.into(),
            kind: LockEventKind::Ready,
            message: format!("ready for {:?}", self.kind),
            event_id: self.event_id.clone(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

fn event_id(instance_id: &str, card_no: CardNo, kind: LockEventKind, timestamp_ms: i64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(&card_no.to_le_bytes());
    hasher.update(&[kind.tag()]);
    hasher.update(&timestamp_ms.to_le_bytes());
    hex::encode(&hasher.finalize().as_bytes()[..16])
}
