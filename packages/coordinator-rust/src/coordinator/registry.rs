//! Canonical operation registry: id -> operation map, FIFO pending queue, and
//! per-entity indices of pending and active operations.
//!
//! The registry is a plain single-owner structure. Concurrency lives one
//! level up: the coordinator keeps it behind a single `parking_lot::Mutex`
//! and every public call takes that lock for the duration of one mutation.
//!
//! Invariants (checked by [`OperationRegistry::check_invariants`]):
//! - every id in `active_by_entity` refers to an `Active` operation filed
//!   under its own entity, and every `Active` operation is indexed;
//! - every id in `pending` refers to a `Pending` operation, appears once,
//!   and every `Pending` operation is queued;
//! - `pending_by_entity` holds exactly the queued ids, each filed under its
//!   own entity.

use std::collections::{HashMap, HashSet, VecDeque};

use opcoord_core::{
    conflict_between, Category, ConflictKind, EntityId, Operation, OperationId, OperationStatus,
    Progress,
};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Terminal outcome applied by [`OperationRegistry::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl Outcome {
    #[must_use]
    pub fn status(&self) -> OperationStatus {
        match self {
            Self::Completed => OperationStatus::Completed,
            Self::Failed(_) => OperationStatus::Failed,
            Self::Cancelled => OperationStatus::Cancelled,
        }
    }
}

/// Which operations a conflict lookup considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictScope {
    /// Only `Active` operations (admission time).
    Active,
    /// `Active` operations plus queued operations of the candidate's own
    /// category (registration time). A queued capture refuses a second
    /// capture but does not hold back a transcription.
    Registration,
}

/// An existing operation that blocks a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    pub id: OperationId,
    pub category: Category,
    pub kind: ConflictKind,
}

/// A broken registry invariant. Only ever produced by a programming defect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("indexed id {0} is missing from the operation map")]
    DanglingIndex(OperationId),
    #[error("id {id} is in the active index but has status {status}")]
    IndexedNotActive {
        id: OperationId,
        status: OperationStatus,
    },
    #[error("id {id} is filed under entity {indexed} but belongs to {actual}")]
    WrongEntity {
        id: OperationId,
        indexed: EntityId,
        actual: EntityId,
    },
    #[error("active operation {0} is missing from the active index")]
    ActiveNotIndexed(OperationId),
    #[error("id {id} is queued but has status {status}")]
    QueuedNotPending {
        id: OperationId,
        status: OperationStatus,
    },
    #[error("pending operation {0} is missing from the queue")]
    PendingNotQueued(OperationId),
    #[error("id {0} appears more than once in the pending queue")]
    DuplicateQueued(OperationId),
    #[error("empty index set left behind for entity {0}")]
    EmptyEntitySet(EntityId),
    #[error("queued operation {0} is missing from the pending entity index")]
    QueuedNotIndexed(OperationId),
    #[error("id {0} is in the pending entity index but not queued")]
    IndexedNotQueued(OperationId),
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Owns every tracked operation plus the indices derived from status.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: HashMap<OperationId, Operation>,
    pending: VecDeque<OperationId>,
    pending_by_entity: HashMap<EntityId, HashSet<OperationId>>,
    active_by_entity: HashMap<EntityId, HashSet<OperationId>>,
    last_cleanup_ms: Option<u64>,
    under_pressure: bool,
}

impl OperationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total tracked operations, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.operations.get(&id)
    }

    /// Iterates all operations in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    /// Pending ids in FIFO order.
    pub fn pending_ids(&self) -> impl Iterator<Item = OperationId> + '_ {
        self.pending.iter().copied()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of operations currently `Active`.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active_by_entity.values().map(HashSet::len).sum()
    }

    /// Active ids filed under `entity`.
    pub fn active_ids_for<'a>(
        &'a self,
        entity: &EntityId,
    ) -> impl Iterator<Item = OperationId> + 'a {
        ids_for(&self.active_by_entity, entity)
    }

    /// Pending ids filed under `entity`, in unspecified order.
    pub fn pending_ids_for<'a>(
        &'a self,
        entity: &EntityId,
    ) -> impl Iterator<Item = OperationId> + 'a {
        ids_for(&self.pending_by_entity, entity)
    }

    /// Entities that currently have at least one active operation.
    pub fn active_entities(&self) -> impl Iterator<Item = &EntityId> {
        self.active_by_entity.keys()
    }

    /// Zero-based FIFO index of `id` among pending operations.
    #[must_use]
    pub fn queue_position(&self, id: OperationId) -> Option<usize> {
        self.pending.iter().position(|queued| *queued == id)
    }

    #[must_use]
    pub fn last_cleanup_ms(&self) -> Option<u64> {
        self.last_cleanup_ms
    }

    pub fn set_last_cleanup_ms(&mut self, at_ms: u64) {
        self.last_cleanup_ms = Some(at_ms);
    }

    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.under_pressure
    }

    pub fn set_under_pressure(&mut self, under_pressure: bool) {
        self.under_pressure = under_pressure;
    }

    /// True if an `Active` operation of `category` exists for `entity`.
    #[must_use]
    pub fn is_active(&self, category: Category, entity: &EntityId) -> bool {
        self.active_ids_for(entity)
            .filter_map(|id| self.operations.get(&id))
            .any(|op| op.category() == category)
    }

    /// First existing operation on `entity` that `candidate` conflicts with.
    ///
    /// Both scopes go through the per-entity indices, so the cost depends on
    /// the operations filed under `entity` and not on the queue length.
    #[must_use]
    pub fn find_conflict(
        &self,
        candidate: Category,
        entity: &EntityId,
        scope: ConflictScope,
        ignore: Option<OperationId>,
    ) -> Option<Blocker> {
        let active = self.active_ids_for(entity).filter_map(|id| self.operations.get(&id));
        let queued = self
            .pending_ids_for(entity)
            .filter(move |_| scope == ConflictScope::Registration)
            .filter_map(|id| self.operations.get(&id))
            .filter(|op| op.category() == candidate);

        active
            .chain(queued)
            .filter(|op| Some(op.id()) != ignore)
            .find_map(|op| {
                conflict_between(candidate, op.category()).map(|kind| Blocker {
                    id: op.id(),
                    category: op.category(),
                    kind,
                })
            })
    }

    /// Inserts a freshly created pending operation at the back of the queue.
    pub fn insert_pending(&mut self, op: Operation) -> OperationId {
        debug_assert_eq!(op.status(), OperationStatus::Pending);
        let id = op.id();
        self.pending.push_back(id);
        index_insert(&mut self.pending_by_entity, op.entity(), id);
        self.operations.insert(id, op);
        id
    }

    /// Pending -> Active, moving the id from the queue into the entity index.
    ///
    /// Does not check conflicts or capacity; callers in the admission layer
    /// do that first.
    pub fn mark_started(&mut self, id: OperationId, now_ms: u64) -> bool {
        let Some(op) = self.operations.get_mut(&id) else {
            return false;
        };
        if !op.mark_started(now_ms) {
            return false;
        }
        let entity = op.entity().clone();
        self.dequeue(id, &entity);
        index_insert(&mut self.active_by_entity, &entity, id);
        true
    }

    /// Applies a terminal outcome, dropping the id from whichever index holds
    /// it. Returns a snapshot of the updated operation, or `None` if the id is
    /// unknown or the state machine refused the transition.
    pub fn finish(&mut self, id: OperationId, outcome: Outcome, now_ms: u64) -> Option<Operation> {
        let op = self.operations.get_mut(&id)?;
        let prior = op.status();
        let applied = match outcome {
            Outcome::Completed => op.mark_completed(now_ms),
            Outcome::Failed(reason) => op.mark_failed(now_ms, reason),
            Outcome::Cancelled => op.mark_cancelled(now_ms),
        };
        if !applied {
            return None;
        }
        let snapshot = op.clone();
        match prior {
            OperationStatus::Pending => self.dequeue(id, snapshot.entity()),
            OperationStatus::Active => {
                index_remove(&mut self.active_by_entity, snapshot.entity(), id);
            }
            _ => {}
        }
        Some(snapshot)
    }

    pub fn set_progress(&mut self, id: OperationId, progress: Progress) -> bool {
        self.operations
            .get_mut(&id)
            .is_some_and(|op| op.set_progress(progress))
    }

    /// Removes every operation for which `keep` returns false and purges the
    /// removed ids from both indices. Returns the number removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Operation) -> bool,
    {
        let before = self.operations.len();
        let mut removed = Vec::new();
        self.operations.retain(|id, op| {
            let kept = keep(op);
            if !kept {
                removed.push((*id, op.entity().clone()));
            }
            kept
        });
        if !removed.is_empty() {
            let gone: HashSet<OperationId> = removed.iter().map(|(id, _)| *id).collect();
            self.pending.retain(|id| !gone.contains(id));
            for (id, entity) in &removed {
                index_remove(&mut self.active_by_entity, entity, *id);
                index_remove(&mut self.pending_by_entity, entity, *id);
            }
        }
        before - self.operations.len()
    }

    /// Verifies the index invariants listed in the module docs.
    ///
    /// # Errors
    ///
    /// Returns the first [`InvariantViolation`] found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut indexed = HashSet::new();
        for (entity, ids) in &self.active_by_entity {
            if ids.is_empty() {
                return Err(InvariantViolation::EmptyEntitySet(entity.clone()));
            }
            for id in ids {
                let op = self
                    .operations
                    .get(id)
                    .ok_or(InvariantViolation::DanglingIndex(*id))?;
                if op.status() != OperationStatus::Active {
                    return Err(InvariantViolation::IndexedNotActive {
                        id: *id,
                        status: op.status(),
                    });
                }
                if op.entity() != entity {
                    return Err(InvariantViolation::WrongEntity {
                        id: *id,
                        indexed: entity.clone(),
                        actual: op.entity().clone(),
                    });
                }
                indexed.insert(*id);
            }
        }

        let mut queued = HashSet::new();
        for id in &self.pending {
            let op = self
                .operations
                .get(id)
                .ok_or(InvariantViolation::DanglingIndex(*id))?;
            if op.status() != OperationStatus::Pending {
                return Err(InvariantViolation::QueuedNotPending {
                    id: *id,
                    status: op.status(),
                });
            }
            if !queued.insert(*id) {
                return Err(InvariantViolation::DuplicateQueued(*id));
            }
            if !self
                .pending_by_entity
                .get(op.entity())
                .is_some_and(|ids| ids.contains(id))
            {
                return Err(InvariantViolation::QueuedNotIndexed(*id));
            }
        }
        for (entity, ids) in &self.pending_by_entity {
            if ids.is_empty() {
                return Err(InvariantViolation::EmptyEntitySet(entity.clone()));
            }
            if let Some(id) = ids.iter().find(|id| !queued.contains(*id)) {
                return Err(InvariantViolation::IndexedNotQueued(*id));
            }
        }

        for op in self.operations.values() {
            match op.status() {
                OperationStatus::Active if !indexed.contains(&op.id()) => {
                    return Err(InvariantViolation::ActiveNotIndexed(op.id()));
                }
                OperationStatus::Pending if !queued.contains(&op.id()) => {
                    return Err(InvariantViolation::PendingNotQueued(op.id()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn dequeue(&mut self, id: OperationId, entity: &EntityId) {
        self.pending.retain(|queued| *queued != id);
        index_remove(&mut self.pending_by_entity, entity, id);
    }
}

fn ids_for<'a>(
    index: &'a HashMap<EntityId, HashSet<OperationId>>,
    entity: &EntityId,
) -> impl Iterator<Item = OperationId> + 'a {
    index
        .get(entity)
        .into_iter()
        .flat_map(|ids| ids.iter().copied())
}

fn index_insert(
    index: &mut HashMap<EntityId, HashSet<OperationId>>,
    entity: &EntityId,
    id: OperationId,
) {
    index.entry(entity.clone()).or_default().insert(id);
}

/// Drops `id` from `entity`'s set, removing the set once it is empty.
fn index_remove(
    index: &mut HashMap<EntityId, HashSet<OperationId>>,
    entity: &EntityId,
    id: OperationId,
) {
    if let Some(set) = index.get_mut(entity) {
        set.remove(&id);
        if set.is_empty() {
            index.remove(entity);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use opcoord_core::{OperationType, Priority};

    use super::*;

    fn pending(reg: &mut OperationRegistry, ty: OperationType) -> OperationId {
        reg.insert_pending(Operation::new(ty, Priority::Medium, 1_000))
    }

    #[test]
    fn insert_queues_in_fifo_order() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("a"));
        let b = pending(&mut reg, OperationType::capture("b"));
        assert_eq!(reg.pending_ids().collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(reg.queue_position(a), Some(0));
        assert_eq!(reg.queue_position(b), Some(1));
        reg.check_invariants().unwrap();
    }

    #[test]
    fn start_moves_id_from_queue_to_entity_index() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        assert!(reg.mark_started(a, 1_100));
        assert_eq!(reg.pending_len(), 0);
        assert_eq!(reg.queue_position(a), None);
        assert_eq!(reg.active_count(), 1);
        assert!(reg.is_active(Category::Capture, &EntityId::from("memo")));
        reg.check_invariants().unwrap();
    }

    #[test]
    fn start_unknown_or_active_is_refused() {
        let mut reg = OperationRegistry::new();
        assert!(!reg.mark_started(OperationId::new(), 1));
        let a = pending(&mut reg, OperationType::capture("memo"));
        assert!(reg.mark_started(a, 2));
        assert!(!reg.mark_started(a, 3));
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn finish_active_drops_entity_index() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        reg.mark_started(a, 1_100);
        let done = reg.finish(a, Outcome::Completed, 1_200).unwrap();
        assert_eq!(done.status(), OperationStatus::Completed);
        assert_eq!(reg.active_count(), 0);
        assert_eq!(reg.active_entities().count(), 0);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn cancel_pending_drops_queue_entry() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        let done = reg.finish(a, Outcome::Cancelled, 1_200).unwrap();
        assert_eq!(done.status(), OperationStatus::Cancelled);
        assert_eq!(reg.pending_len(), 0);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn finish_terminal_is_refused() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        reg.mark_started(a, 1);
        reg.finish(a, Outcome::Failed("boom".into()), 2).unwrap();
        assert!(reg.finish(a, Outcome::Completed, 3).is_none());
        assert!(reg.finish(a, Outcome::Cancelled, 3).is_none());
        assert_eq!(reg.get(a).unwrap().status(), OperationStatus::Failed);
    }

    #[test]
    fn find_conflict_respects_scope() {
        let mut reg = OperationRegistry::new();
        let memo = EntityId::from("memo");
        let cap = pending(&mut reg, OperationType::capture("memo"));

        // A queued capture blocks a second capture at registration, nothing
        // else.
        for scope in [ConflictScope::Active, ConflictScope::Registration] {
            assert!(reg
                .find_conflict(Category::Transcription, &memo, scope, None)
                .is_none());
        }
        let blocker = reg
            .find_conflict(Category::Capture, &memo, ConflictScope::Registration, None)
            .unwrap();
        assert_eq!(blocker.id, cap);
        assert_eq!(blocker.kind, ConflictKind::DuplicateCapture);
        assert!(reg
            .find_conflict(Category::Capture, &memo, ConflictScope::Active, None)
            .is_none());

        reg.mark_started(cap, 2);
        let blocker = reg
            .find_conflict(Category::Transcription, &memo, ConflictScope::Active, None)
            .unwrap();
        assert_eq!(blocker.kind, ConflictKind::CaptureInProgress);
        // Other entities are unaffected.
        assert!(reg
            .find_conflict(
                Category::Transcription,
                &EntityId::from("other"),
                ConflictScope::Registration,
                None
            )
            .is_none());
    }

    #[test]
    fn find_conflict_ignores_self() {
        let mut reg = OperationRegistry::new();
        let memo = EntityId::from("memo");
        let cap = pending(&mut reg, OperationType::capture("memo"));
        assert!(reg
            .find_conflict(Category::Capture, &memo, ConflictScope::Registration, Some(cap))
            .is_none());
    }

    #[test]
    fn pending_index_follows_queue() {
        let mut reg = OperationRegistry::new();
        let memo = EntityId::from("memo");
        let a = pending(&mut reg, OperationType::transcription("memo"));
        let b = pending(&mut reg, OperationType::analysis("memo"));
        let c = pending(&mut reg, OperationType::analysis("other"));
        let mut ids: Vec<_> = reg.pending_ids_for(&memo).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        reg.mark_started(a, 2);
        reg.finish(b, Outcome::Cancelled, 3).unwrap();
        assert_eq!(reg.pending_ids_for(&memo).count(), 0);
        assert_eq!(reg.pending_ids_for(&EntityId::from("other")).collect::<Vec<_>>(), vec![c]);
        reg.check_invariants().unwrap();

        reg.retain(|op| op.id() != c);
        assert_eq!(reg.pending_ids_for(&EntityId::from("other")).count(), 0);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn retain_purges_indices() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("a"));
        let b = pending(&mut reg, OperationType::capture("b"));
        reg.mark_started(b, 5);
        let removed = reg.retain(|_| false);
        assert_eq!(removed, 2);
        assert!(reg.is_empty());
        assert_eq!(reg.pending_len(), 0);
        assert_eq!(reg.active_count(), 0);
        assert!(reg.get(a).is_none());
        reg.check_invariants().unwrap();
    }

    #[test]
    fn progress_requires_active() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::transcription("memo"));
        assert!(!reg.set_progress(a, Progress::new(0.1, "queued")));
        reg.mark_started(a, 2);
        assert!(reg.set_progress(a, Progress::new(0.4, "chunk 2/5")));
        assert_eq!(reg.get(a).unwrap().progress().fraction, 0.4);
        assert!(!reg.set_progress(OperationId::new(), Progress::default()));
    }

    #[test]
    fn invariant_check_catches_stale_index() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        // Simulate a defect: index an operation that never started.
        reg.active_by_entity
            .entry(EntityId::from("memo"))
            .or_default()
            .insert(a);
        assert!(matches!(
            reg.check_invariants(),
            Err(InvariantViolation::IndexedNotActive { .. })
        ));
    }

    #[test]
    fn invariant_check_catches_unindexed_queue_entry() {
        let mut reg = OperationRegistry::new();
        let a = pending(&mut reg, OperationType::capture("memo"));
        reg.pending_by_entity.clear();
        assert_eq!(
            reg.check_invariants(),
            Err(InvariantViolation::QueuedNotIndexed(a))
        );
    }
}
