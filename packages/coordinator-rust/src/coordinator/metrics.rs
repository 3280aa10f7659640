//! Read-only metrics and introspection over a registry snapshot.
//!
//! Everything here takes `&OperationRegistry`; the coordinator holds the lock
//! only while a snapshot is collected.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use opcoord_core::{Category, EntityId, Operation, OperationStatus, OperationSummary, Priority};
use serde::{Deserialize, Serialize};

use super::registry::OperationRegistry;
use crate::config::CoordinatorConfig;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Category grouping for [`summaries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryGroup {
    #[default]
    All,
    Capture,
    /// Transcription and analysis.
    Processing,
    Transcription,
    Analysis,
}

impl CategoryGroup {
    #[must_use]
    pub fn contains(self, category: Category) -> bool {
        match self {
            Self::All => true,
            Self::Capture => category == Category::Capture,
            Self::Processing => matches!(category, Category::Transcription | Category::Analysis),
            Self::Transcription => category == Category::Transcription,
            Self::Analysis => category == Category::Analysis,
        }
    }
}

/// Status grouping for [`summaries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    /// Pending and active.
    InFlight,
    Completed,
    /// Failed and cancelled.
    Failed,
}

impl StatusFilter {
    #[must_use]
    pub fn contains(self, status: OperationStatus) -> bool {
        match self {
            Self::All => true,
            Self::InFlight => !status.is_terminal(),
            Self::Completed => status == OperationStatus::Completed,
            Self::Failed => matches!(status, OperationStatus::Failed | OperationStatus::Cancelled),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Aggregate counts over every tracked operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub total: usize,
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Mean execution time of completed operations, if any completed.
    pub average_execution_ms: Option<f64>,
    pub by_category: BTreeMap<Category, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    pub queue_depth: usize,
}

impl OperationMetrics {
    /// Count for a single status.
    #[must_use]
    pub fn count(&self, status: OperationStatus) -> usize {
        match status {
            OperationStatus::Pending => self.pending,
            OperationStatus::Active => self.active,
            OperationStatus::Completed => self.completed,
            OperationStatus::Failed => self.failed,
            OperationStatus::Cancelled => self.cancelled,
        }
    }
}

/// [`OperationMetrics`] plus coordinator-wide settings and state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    #[serde(flatten)]
    pub operations: OperationMetrics,
    pub max_concurrent_operations: usize,
    pub max_history: usize,
    pub under_pressure: bool,
    pub last_cleanup_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub(crate) fn collect(registry: &OperationRegistry) -> OperationMetrics {
    let mut metrics = OperationMetrics {
        queue_depth: registry.pending_len(),
        ..OperationMetrics::default()
    };
    let mut completed_ms: u128 = 0;
    let mut timed = 0usize;

    for op in registry.iter() {
        metrics.total += 1;
        match op.status() {
            OperationStatus::Pending => metrics.pending += 1,
            OperationStatus::Active => metrics.active += 1,
            OperationStatus::Completed => {
                metrics.completed += 1;
                if let Some(duration) = op.execution_duration() {
                    completed_ms += duration.as_millis();
                    timed += 1;
                }
            }
            OperationStatus::Failed => metrics.failed += 1,
            OperationStatus::Cancelled => metrics.cancelled += 1,
        }
        *metrics.by_category.entry(op.category()).or_default() += 1;
        *metrics.by_priority.entry(op.priority()).or_default() += 1;
    }

    if timed > 0 {
        metrics.average_execution_ms = Some(completed_ms as f64 / timed as f64);
    }
    metrics
}

#[must_use]
pub(crate) fn collect_system(
    registry: &OperationRegistry,
    config: &CoordinatorConfig,
) -> SystemMetrics {
    SystemMetrics {
        operations: collect(registry),
        max_concurrent_operations: config.max_concurrent_operations,
        max_history: config.max_history,
        under_pressure: registry.under_pressure(),
        last_cleanup_ms: registry.last_cleanup_ms(),
    }
}

/// Filtered projections, newest first by creation time.
#[must_use]
pub(crate) fn summaries(
    registry: &OperationRegistry,
    group: CategoryGroup,
    filter: StatusFilter,
    entity: Option<&EntityId>,
) -> Vec<OperationSummary> {
    let mut matched: Vec<&Operation> = registry
        .iter()
        .filter(|op| group.contains(op.category()))
        .filter(|op| filter.contains(op.status()))
        .filter(|op| entity.map_or(true, |e| op.entity() == e))
        .collect();
    matched.sort_by(|a, b| {
        b.created_at_ms()
            .cmp(&a.created_at_ms())
            .then_with(|| b.id().cmp(&a.id()))
    });
    matched.into_iter().map(OperationSummary::from).collect()
}

/// Human-readable dump of metrics, the pending queue and the active index.
#[must_use]
pub(crate) fn debug_dump(registry: &OperationRegistry, config: &CoordinatorConfig) -> String {
    let system = collect_system(registry, config);
    let m = &system.operations;
    let mut out = String::new();

    let _ = writeln!(out, "=== operation coordinator ===");
    let _ = writeln!(
        out,
        "total={} pending={} active={}/{} completed={} failed={} cancelled={}",
        m.total,
        m.pending,
        m.active,
        system.max_concurrent_operations,
        m.completed,
        m.failed,
        m.cancelled
    );
    match m.average_execution_ms {
        Some(avg) => {
            let _ = writeln!(out, "avg_execution_ms={avg:.1}");
        }
        None => {
            let _ = writeln!(out, "avg_execution_ms=n/a");
        }
    }
    let _ = writeln!(
        out,
        "under_pressure={} max_history={} last_cleanup_ms={}",
        system.under_pressure,
        system.max_history,
        system
            .last_cleanup_ms
            .map_or_else(|| "never".to_string(), |t| t.to_string())
    );
    for (category, count) in &m.by_category {
        let _ = writeln!(out, "category {category}: {count}");
    }

    let _ = writeln!(out, "--- pending queue ({}) ---", registry.pending_len());
    for (pos, id) in registry.pending_ids().enumerate() {
        if let Some(op) = registry.get(id) {
            let _ = writeln!(
                out,
                "#{pos} {id} {} {} priority={}",
                op.category(),
                op.entity(),
                op.priority().as_str()
            );
        }
    }

    let _ = writeln!(out, "--- active by entity ---");
    let mut entities: Vec<&EntityId> = registry.active_entities().collect();
    entities.sort();
    for entity in entities {
        let mut ops: Vec<&Operation> = registry
            .active_ids_for(entity)
            .filter_map(|id| registry.get(id))
            .collect();
        ops.sort_by_key(|op| (op.started_at_ms(), op.id()));
        let listed: Vec<String> = ops
            .iter()
            .map(|op| {
                format!(
                    "{} {} ({:.0}% {})",
                    op.category(),
                    op.id(),
                    op.progress().fraction * 100.0,
                    op.progress().stage
                )
            })
            .collect();
        let _ = writeln!(out, "{entity}: {}", listed.join(", "));
    }
    out
}

/// Publishes gauges through the `metrics` facade. No-op without a recorder.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn publish(registry: &OperationRegistry) {
    let m = collect(registry);
    for status in OperationStatus::ALL {
        metrics::gauge!("opcoord_operations", "status" => status.as_str())
            .set(m.count(status) as f64);
    }
    metrics::gauge!("opcoord_pending_queue_depth").set(m.queue_depth as f64);
    metrics::gauge!("opcoord_under_pressure").set(if registry.under_pressure() {
        1.0
    } else {
        0.0
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
