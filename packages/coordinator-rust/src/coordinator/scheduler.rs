//! Queue scheduler: greedy FIFO re-admission of pending operations.
//!
//! Runs after every registration and terminal transition, and on demand.
//! Pending operations are tried strictly in arrival order; one that
//! conflicts with an active operation is skipped and keeps its place, and the
//! scan stops as soon as the concurrency ceiling is reached. Priority never
//! reorders the queue.

use opcoord_core::Operation;

use super::admission::{try_start, StartRejection};
use super::registry::OperationRegistry;

/// Starts as many pending operations as the ceiling and conflict table allow.
/// Returns snapshots of the operations that were started, in start order.
pub(crate) fn admit_pending(
    registry: &mut OperationRegistry,
    limit: usize,
    now_ms: u64,
) -> Vec<Operation> {
    let mut started = Vec::new();
    let queued: Vec<_> = registry.pending_ids().collect();
    for id in queued {
        if registry.active_count() >= limit {
            break;
        }
        match try_start(registry, id, limit, now_ms) {
            Ok(op) => started.push(op),
            Err(StartRejection::AtCapacity { .. }) => break,
            Err(_) => {}
        }
    }
    started
}
