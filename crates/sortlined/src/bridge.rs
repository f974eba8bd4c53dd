//! Upstream event bridge: routes `ChuteAssignment` events from the
//! routing client into the formal strategy's pending waits.

use tokio::sync::{broadcast, mpsc};

use sortline_services::{ChuteAssignment, PendingAssignments, ResolveOutcome};

pub async fn bridge_loop(
    mut assignments: mpsc::UnboundedReceiver<ChuteAssignment>,
    pending: PendingAssignments,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut unmatched: u64 = 0;
    loop {
        let assignment = tokio::select! {
            _ = shutdown.recv() => break,
            a = assignments.recv() => match a {
                Some(a) => a,
                None => {
                    tracing::warn!("assignment channel closed");
                    break;
                }
            },
        };

        match pending.resolve(assignment.parcel_id, assignment.chute_id) {
            ResolveOutcome::Resolved => {
                tracing::trace!(parcel_id = assignment.parcel_id, chute_id = assignment.chute_id, "assignment delivered");
            }
            ResolveOutcome::NotFound => unmatched += 1,
        }
    }
    tracing::debug!(unmatched, "upstream bridge stopped");
}
