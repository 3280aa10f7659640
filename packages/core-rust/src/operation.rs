//! Operation model: identifiers, the closed operation-type enum, priority,
//! status state machine, progress, and the read-only summary projection.
//!
//! An [`Operation`] only ever moves forward through its status machine:
//!
//! ```text
//! Pending -> Active -> Completed | Failed | Cancelled
//! Pending -> Completed | Failed | Cancelled
//! ```
//!
//! The second line covers owners that finish work without an explicit
//! start, and cancellation of queued work.
//!
//! The mutating methods on [`Operation`] enforce that machine and report
//! whether the transition was applied; they never panic.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, unique identifier assigned to an operation at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the business entity (a recording) an operation acts upon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id is empty or whitespace only. Blank ids are rejected
    /// at registration.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Category / OperationType
// ---------------------------------------------------------------------------

/// Kind of long-running work an operation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Audio capture into the recording's file.
    Capture,
    /// Speech-to-text over a finished recording.
    Transcription,
    /// Summarisation / analysis over a transcript.
    Analysis,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 3] = [Category::Capture, Category::Transcription, Category::Analysis];

    /// Stable lowercase name, used in logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Transcription => "transcription",
            Self::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed operation: a category together with the recording it acts upon.
///
/// Closed on purpose so the conflict table in [`crate::conflict`] can match
/// on it exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum OperationType {
    Capture { recording_id: EntityId },
    Transcription { recording_id: EntityId },
    Analysis { recording_id: EntityId },
}

impl OperationType {
    #[must_use]
    pub fn capture(recording_id: impl Into<EntityId>) -> Self {
        Self::Capture {
            recording_id: recording_id.into(),
        }
    }

    #[must_use]
    pub fn transcription(recording_id: impl Into<EntityId>) -> Self {
        Self::Transcription {
            recording_id: recording_id.into(),
        }
    }

    #[must_use]
    pub fn analysis(recording_id: impl Into<EntityId>) -> Self {
        Self::Analysis {
            recording_id: recording_id.into(),
        }
    }

    /// Builds the variant matching `category` for the given recording.
    #[must_use]
    pub fn from_parts(category: Category, recording_id: impl Into<EntityId>) -> Self {
        match category {
            Category::Capture => Self::capture(recording_id),
            Category::Transcription => Self::transcription(recording_id),
            Category::Analysis => Self::analysis(recording_id),
        }
    }

    #[must_use]
    pub fn category(&self) -> Category {
        match self {
            Self::Capture { .. } => Category::Capture,
            Self::Transcription { .. } => Category::Transcription,
            Self::Analysis { .. } => Category::Analysis,
        }
    }

    /// The owning entity (recording) id.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        match self {
            Self::Capture { recording_id }
            | Self::Transcription { recording_id }
            | Self::Analysis { recording_id } => recording_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Priority / Status / Progress
// ---------------------------------------------------------------------------

/// Ordinal priority recorded at registration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Medium, Priority::High];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Registered, waiting for admission.
    Pending,
    /// Admitted; the owning service is doing the work.
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 5] = [
        OperationStatus::Pending,
        OperationStatus::Active,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::Cancelled,
    ];

    /// Completed, failed and cancelled are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (
                    Self::Pending | Self::Active,
                    Self::Completed | Self::Failed | Self::Cancelled
                )
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured progress reported by the owning service while active.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion fraction in `0.0..=1.0`.
    pub fraction: f64,
    /// Free-form stage label (e.g. `"uploading"`, `"chunk 3/8"`).
    pub stage: String,
}

impl Progress {
    /// Creates a progress value, clamping `fraction` into `0.0..=1.0`.
    /// A NaN fraction is stored as `0.0`.
    #[must_use]
    pub fn new(fraction: f64, stage: impl Into<String>) -> Self {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        Self {
            fraction,
            stage: stage.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A tracked unit of long-running work tied to a recording.
///
/// Identity, type, priority and creation time are fixed at construction.
/// Everything else changes only through the state-machine methods below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    id: OperationId,
    op_type: OperationType,
    priority: Priority,
    status: OperationStatus,
    progress: Progress,
    created_at_ms: u64,
    started_at_ms: Option<u64>,
    completed_at_ms: Option<u64>,
    error_description: Option<String>,
}

impl Operation {
    /// Creates a pending operation stamped with `now_ms`.
    #[must_use]
    pub fn new(op_type: OperationType, priority: Priority, now_ms: u64) -> Self {
        Self {
            id: OperationId::new(),
            op_type,
            priority,
            status: OperationStatus::Pending,
            progress: Progress::default(),
            created_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            error_description: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn op_type(&self) -> &OperationType {
        &self.op_type
    }

    #[must_use]
    pub fn category(&self) -> Category {
        self.op_type.category()
    }

    #[must_use]
    pub fn entity(&self) -> &EntityId {
        self.op_type.entity()
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    #[must_use]
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    #[must_use]
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    #[must_use]
    pub fn started_at_ms(&self) -> Option<u64> {
        self.started_at_ms
    }

    #[must_use]
    pub fn completed_at_ms(&self) -> Option<u64> {
        self.completed_at_ms
    }

    /// Caller-supplied failure reason; only set on `Failed`.
    #[must_use]
    pub fn error_description(&self) -> Option<&str> {
        self.error_description.as_deref()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `completed_at - started_at` once terminal. `None` for operations that
    /// finished straight from pending or are still in flight.
    #[must_use]
    pub fn execution_duration(&self) -> Option<Duration> {
        match (self.started_at_ms, self.completed_at_ms) {
            (Some(start), Some(end)) => Some(Duration::from_millis(end.saturating_sub(start))),
            _ => None,
        }
    }

    /// Time used for age-based eviction: completion time if terminal,
    /// otherwise creation time.
    #[must_use]
    pub fn reference_time_ms(&self) -> u64 {
        self.completed_at_ms.unwrap_or(self.created_at_ms)
    }

    /// Pending -> Active. Returns `false` (and changes nothing) from any
    /// other status.
    pub fn mark_started(&mut self, now_ms: u64) -> bool {
        if !self.status.can_transition_to(OperationStatus::Active) {
            return false;
        }
        self.status = OperationStatus::Active;
        self.started_at_ms = Some(now_ms);
        true
    }

    /// Pending or Active -> Completed.
    pub fn mark_completed(&mut self, now_ms: u64) -> bool {
        self.finish(OperationStatus::Completed, now_ms, None)
    }

    /// Pending or Active -> Failed, recording `reason`.
    pub fn mark_failed(&mut self, now_ms: u64, reason: impl Into<String>) -> bool {
        self.finish(OperationStatus::Failed, now_ms, Some(reason.into()))
    }

    /// Pending or Active -> Cancelled.
    pub fn mark_cancelled(&mut self, now_ms: u64) -> bool {
        self.finish(OperationStatus::Cancelled, now_ms, None)
    }

    /// Replaces progress while active. Ignored in any other status.
    pub fn set_progress(&mut self, progress: Progress) -> bool {
        if self.status != OperationStatus::Active {
            return false;
        }
        self.progress = progress;
        true
    }

    fn finish(&mut self, status: OperationStatus, now_ms: u64, error: Option<String>) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.completed_at_ms = Some(now_ms);
        self.error_description = error;
        true
    }
}

// ---------------------------------------------------------------------------
// OperationSummary
// ---------------------------------------------------------------------------

/// Lightweight read projection of an [`Operation`] for status consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub id: OperationId,
    pub category: Category,
    pub entity: EntityId,
    pub priority: Priority,
    pub status: OperationStatus,
    pub progress: Progress,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl From<&Operation> for OperationSummary {
    fn from(op: &Operation) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = op.execution_duration().map(|d| d.as_millis() as u64);
        Self {
            id: op.id,
            category: op.category(),
            entity: op.entity().clone(),
            priority: op.priority,
            status: op.status,
            progress: op.progress.clone(),
            created_at_ms: op.created_at_ms,
            completed_at_ms: op.completed_at_ms,
            duration_ms,
            error: op.error_description.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
