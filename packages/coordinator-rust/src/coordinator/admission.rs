//! Admission rules: the checks behind `register`, `start` and `can_admit`.
//!
//! Registration is checked against the active operations on the entity plus
//! queued operations of the same category, so a second capture is refused
//! even while the first one waits for a slot. Admission (`start`) is checked
//! against active operations only, plus the global concurrency ceiling.

use opcoord_core::{Category, EntityId, Operation, OperationId, OperationStatus, OperationType};

use super::registry::{Blocker, ConflictScope, OperationRegistry};
use crate::error::RegisterError;

/// Why an operation could not be moved from pending to active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartRejection {
    Unknown,
    NotPending(OperationStatus),
    Conflict(Blocker),
    AtCapacity { active: usize, limit: usize },
}

impl StartRejection {
    /// Rejections caused by a caller bookkeeping mistake rather than policy.
    pub(crate) fn is_caller_error(&self) -> bool {
        matches!(self, Self::Unknown | Self::NotPending(_))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Unknown => "unknown operation".to_string(),
            Self::NotPending(status) => format!("operation is {status}, not pending"),
            Self::Conflict(blocker) => {
                format!("{} (blocked by {} {})", blocker.kind, blocker.category, blocker.id)
            }
            Self::AtCapacity { active, limit } => {
                format!("concurrency limit reached ({active}/{limit})")
            }
        }
    }
}

/// Validates a registration request without touching the registry.
pub(crate) fn check_register(
    registry: &OperationRegistry,
    op_type: &OperationType,
) -> Result<(), RegisterError> {
    let entity = op_type.entity();
    if entity.is_blank() {
        return Err(RegisterError::MissingEntity);
    }
    let category = op_type.category();
    match registry.find_conflict(category, entity, ConflictScope::Registration, None) {
        Some(blocker) => Err(RegisterError::Conflict {
            category,
            entity: entity.clone(),
            kind: blocker.kind,
            blocking_category: blocker.category,
            blocking_id: blocker.id,
        }),
        None => Ok(()),
    }
}

/// Whether an operation of `category` on `entity` would be accepted by
/// `register` right now. A queued capture does not make a transcription
/// inadmissible; only an active one does.
pub(crate) fn can_admit(registry: &OperationRegistry, category: Category, entity: &EntityId) -> bool {
    !entity.is_blank()
        && registry
            .find_conflict(category, entity, ConflictScope::Registration, None)
            .is_none()
}

/// Attempts pending -> active for `id`. On success returns a snapshot of the
/// now-active operation; on failure the registry is unchanged.
pub(crate) fn try_start(
    registry: &mut OperationRegistry,
    id: OperationId,
    limit: usize,
    now_ms: u64,
) -> Result<Operation, StartRejection> {
    let op = registry.get(id).ok_or(StartRejection::Unknown)?;
    if op.status() != OperationStatus::Pending {
        return Err(StartRejection::NotPending(op.status()));
    }
    if let Some(blocker) =
        registry.find_conflict(op.category(), op.entity(), ConflictScope::Active, Some(id))
    {
        return Err(StartRejection::Conflict(blocker));
    }
    let active = registry.active_count();
    if active >= limit {
        return Err(StartRejection::AtCapacity { active, limit });
    }
    registry.mark_started(id, now_ms);
    registry.get(id).cloned().ok_or(StartRejection::Unknown)
}
