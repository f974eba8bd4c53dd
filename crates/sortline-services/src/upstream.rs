//! Upstream routing service contract.
//!
//! The transport is someone else's problem. The core only needs to know
//! whether the client is connected and to be able to announce a parcel;
//! assignments come back as `ChuteAssignment` events that the caller
//! bridges into `PendingAssignments::resolve`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sortline_core::{ChuteId, ParcelId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChuteAssignment {
    pub parcel_id: ParcelId,
    pub chute_id: ChuteId,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream not connected")]
    NotConnected,
    #[error("upstream send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Announce a detected parcel. `Ok(false)` means the upstream refused it.
    async fn notify_parcel_detected(&self, parcel_id: ParcelId) -> Result<bool, UpstreamError>;
}
