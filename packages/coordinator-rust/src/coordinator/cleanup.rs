//! Memory-pressure monitor and cleanup engine.
//!
//! Each pass:
//! 1. Detects pressure from the `operations / max_history` ratio and the
//!    host thermal state, logging every on/off transition.
//! 2. Picks the retention threshold (shorter under pressure).
//! 3. Time sweep: drops finished operations older than the threshold.
//! 4. Count sweep: if still above `max_history`, keeps only the most recent
//!    finished operations per bucket (recent / completed / failed+cancelled).
//! 5. Emergency sweep: if still under pressure, keeps only the newest
//!    finished operations plus recent failures.
//!
//! Pending and active operations are never removed by any step.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opcoord_core::{Operation, OperationId, OperationStatus};
use serde::Serialize;
use tokio::sync::oneshot;

use super::registry::OperationRegistry;
use super::Shared;
use crate::config::{CleanupConfig, CoordinatorConfig};
use crate::log::{LogLevel, LogSink};
use crate::thermal::ThermalState;
use crate::worker::BackgroundRunnable;

// ---------------------------------------------------------------------------
// Pressure detection
// ---------------------------------------------------------------------------

/// Inputs and verdict of one pressure check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureReading {
    /// `operations / max_history`.
    pub ratio: f64,
    pub thermal: ThermalState,
    pub under_pressure: bool,
}

/// Pressure is on when the count ratio exceeds the configured ratio or the
/// thermal state reaches the configured threshold.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn read_pressure(
    operation_count: usize,
    max_history: usize,
    thermal: ThermalState,
    config: &CleanupConfig,
) -> PressureReading {
    let ratio = operation_count as f64 / max_history.max(1) as f64;
    PressureReading {
        ratio,
        thermal,
        under_pressure: ratio > config.pressure_ratio || thermal >= config.thermal_threshold,
    }
}

// ---------------------------------------------------------------------------
// SweepReport
// ---------------------------------------------------------------------------

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub ran_at_ms: u64,
    pub pressure: PressureReading,
    /// Pressure flag before this pass, for transition logging.
    pub was_under_pressure: bool,
    pub retention: Duration,
    pub removed_expired: usize,
    pub removed_over_cap: usize,
    pub removed_emergency: usize,
    pub remaining: usize,
}

impl SweepReport {
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.pressure.under_pressure
    }

    #[must_use]
    pub fn total_removed(&self) -> usize {
        self.removed_expired + self.removed_over_cap + self.removed_emergency
    }
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

/// Removes finished operations whose reference time is older than
/// `retention`. Returns the number removed.
pub fn sweep_expired(registry: &mut OperationRegistry, now_ms: u64, retention: Duration) -> usize {
    let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
    let cutoff = now_ms.saturating_sub(retention_ms);
    registry.retain(|op| !op.is_terminal() || op.reference_time_ms() >= cutoff)
}

/// Keeps non-terminal operations plus the union of the newest `recent_limit`
/// finished operations, the newest `completed_limit` completed ones and the
/// newest `error_limit` failed or cancelled ones. No-op while the registry is
/// within `max_history`.
pub fn sweep_over_cap(
    registry: &mut OperationRegistry,
    max_history: usize,
    config: &CleanupConfig,
) -> usize {
    if registry.len() <= max_history {
        return 0;
    }
    let finished = newest_finished(registry);

    let mut keep: HashSet<OperationId> = HashSet::new();
    keep.extend(finished.iter().take(config.recent_limit).map(|op| op.id()));
    keep.extend(
        finished
            .iter()
            .filter(|op| op.status() == OperationStatus::Completed)
            .take(config.completed_limit)
            .map(|op| op.id()),
    );
    keep.extend(
        finished
            .iter()
            .filter(|op| {
                matches!(
                    op.status(),
                    OperationStatus::Failed | OperationStatus::Cancelled
                )
            })
            .take(config.error_limit)
            .map(|op| op.id()),
    );

    registry.retain(|op| !op.is_terminal() || keep.contains(&op.id()))
}

/// Keeps non-terminal operations, the newest `emergency_recent_limit`
/// finished operations, and failures newer than the emergency window.
pub fn sweep_emergency(registry: &mut OperationRegistry, now_ms: u64, config: &CleanupConfig) -> usize {
    let window_ms = u64::try_from(config.emergency_failure_window.as_millis()).unwrap_or(u64::MAX);
    let failure_cutoff = now_ms.saturating_sub(window_ms);

    let keep: HashSet<OperationId> = newest_finished(registry)
        .iter()
        .take(config.emergency_recent_limit)
        .map(|op| op.id())
        .collect();

    registry.retain(|op| {
        !op.is_terminal()
            || keep.contains(&op.id())
            || (op.status() == OperationStatus::Failed && op.reference_time_ms() >= failure_cutoff)
    })
}

/// Finished operations, newest first. Ties on time are broken by id so the
/// order is stable across passes.
fn newest_finished(registry: &OperationRegistry) -> Vec<Operation> {
    let mut finished: Vec<Operation> = registry
        .iter()
        .filter(|op| op.is_terminal())
        .cloned()
        .collect();
    finished.sort_by(|a, b| {
        b.reference_time_ms()
            .cmp(&a.reference_time_ms())
            .then_with(|| b.id().cmp(&a.id()))
    });
    finished
}

/// Runs one full pass (steps 1-5) against `registry`.
pub(crate) fn run_pass(
    registry: &mut OperationRegistry,
    config: &CoordinatorConfig,
    thermal: ThermalState,
    now_ms: u64,
) -> SweepReport {
    let cleanup = &config.cleanup;
    let was_under_pressure = registry.under_pressure();
    let pressure = read_pressure(registry.len(), config.max_history, thermal, cleanup);
    registry.set_under_pressure(pressure.under_pressure);

    let retention = cleanup.retention(pressure.under_pressure);
    let removed_expired = sweep_expired(registry, now_ms, retention);
    let removed_over_cap = sweep_over_cap(registry, config.max_history, cleanup);

    let removed_emergency = if pressure.under_pressure
        && read_pressure(registry.len(), config.max_history, thermal, cleanup).under_pressure
    {
        sweep_emergency(registry, now_ms, cleanup)
    } else {
        0
    };

    registry.set_last_cleanup_ms(now_ms);
    SweepReport {
        ran_at_ms: now_ms,
        pressure,
        was_under_pressure,
        retention,
        removed_expired,
        removed_over_cap,
        removed_emergency,
        remaining: registry.len(),
    }
}

/// Emits the pressure-transition and sweep-summary records for a pass.
pub(crate) fn log_report(log: &dyn LogSink, report: &SweepReport) {
    let pressure = &report.pressure;
    if pressure.under_pressure != report.was_under_pressure {
        let (level, message) = if pressure.under_pressure {
            (LogLevel::Warn, "memory pressure detected")
        } else {
            (LogLevel::Info, "memory pressure relieved")
        };
        log.log(
            level,
            "pressure",
            message,
            &[
                ("ratio", format!("{:.2}", pressure.ratio)),
                ("thermal", pressure.thermal.as_str().to_string()),
            ],
        );
    }

    let level = if report.total_removed() > 0 {
        LogLevel::Info
    } else {
        LogLevel::Debug
    };
    log.log(
        level,
        "cleanup",
        "cleanup sweep complete",
        &[
            ("removed_expired", report.removed_expired.to_string()),
            ("removed_over_cap", report.removed_over_cap.to_string()),
            ("removed_emergency", report.removed_emergency.to_string()),
            ("remaining", report.remaining.to_string()),
            ("under_pressure", pressure.under_pressure.to_string()),
            ("retention_secs", report.retention.as_secs().to_string()),
        ],
    );
}

// ---------------------------------------------------------------------------
// CleanupEngine (background runnable)
// ---------------------------------------------------------------------------

/// Task variants for the cleanup worker.
#[derive(Debug)]
pub enum CleanupTask {
    /// Run a pass now and reply with its report.
    RunNow(oneshot::Sender<SweepReport>),
}

/// Periodic cleanup loop body. The registry lock is only taken inside a pass,
/// never across the worker's sleep.
pub struct CleanupEngine {
    shared: Arc<Shared>,
}

impl CleanupEngine {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl BackgroundRunnable for CleanupEngine {
    type Task = CleanupTask;

    async fn run(&mut self, task: CleanupTask) {
        match task {
            CleanupTask::RunNow(reply) => {
                let report = self.shared.run_cleanup();
                let _ = reply.send(report);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.shared.run_cleanup();
    }

    fn next_tick_delay(&self) -> Duration {
        let under_pressure = self.shared.registry.lock().under_pressure();
        self.shared.config.cleanup.interval(under_pressure)
    }

    async fn shutdown(&mut self) {
        self.shared
            .log
            .log(LogLevel::Debug, "cleanup", "cleanup loop stopped", &[]);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use opcoord_core::{OperationType, Priority};
    use proptest::prelude::*;

    use super::*;
    use crate::coordinator::registry::Outcome;
    use crate::log::MemoryLogSink;

    const MINUTE_MS: u64 = 60_000;

    /// Inserts an operation that reached `status` at `at_ms`.
    fn finished(
        reg: &mut OperationRegistry,
        entity: &str,
        status: OperationStatus,
        at_ms: u64,
    ) -> OperationId {
        let op = Operation::new(OperationType::analysis(entity), Priority::Medium, at_ms);
        let id = reg.insert_pending(op);
        if status == OperationStatus::Cancelled {
            reg.finish(id, Outcome::Cancelled, at_ms).unwrap();
            return id;
        }
        reg.mark_started(id, at_ms);
        let outcome = match status {
            OperationStatus::Completed => Outcome::Completed,
            OperationStatus::Failed => Outcome::Failed("error".into()),
            _ => return id,
        };
        reg.finish(id, outcome, at_ms).unwrap();
        id
    }

    fn active(reg: &mut OperationRegistry, entity: &str, at_ms: u64) -> OperationId {
        let id = reg.insert_pending(Operation::new(
            OperationType::capture(entity),
            Priority::High,
            at_ms,
        ));
        reg.mark_started(id, at_ms);
        id
    }

    #[test]
    fn pressure_from_ratio_or_thermal() {
        let cfg = CleanupConfig::default();
        assert!(!read_pressure(80, 100, ThermalState::Nominal, &cfg).under_pressure);
        assert!(read_pressure(81, 100, ThermalState::Nominal, &cfg).under_pressure);
        assert!(!read_pressure(0, 100, ThermalState::Fair, &cfg).under_pressure);
        assert!(read_pressure(0, 100, ThermalState::Serious, &cfg).under_pressure);
        assert!(read_pressure(0, 100, ThermalState::Critical, &cfg).under_pressure);
    }

    #[test]
    fn expired_sweep_uses_reference_time() {
        let mut reg = OperationRegistry::new();
        let now = 100 * MINUTE_MS;
        let old = finished(&mut reg, "a", OperationStatus::Completed, now - 61 * MINUTE_MS);
        let fresh = finished(&mut reg, "b", OperationStatus::Failed, now - 59 * MINUTE_MS);
        let running = active(&mut reg, "c", 0);

        let removed = sweep_expired(&mut reg, now, Duration::from_secs(3_600));
        assert_eq!(removed, 1);
        assert!(reg.get(old).is_none());
        assert!(reg.get(fresh).is_some());
        assert!(reg.get(running).is_some());
        reg.check_invariants().unwrap();
    }

    #[test]
    fn pressure_retention_evicts_what_standard_keeps() {
        let cfg = CleanupConfig::default();
        let now = 100 * MINUTE_MS;

        let mut standard = OperationRegistry::new();
        let id = finished(&mut standard, "a", OperationStatus::Completed, now - 10 * MINUTE_MS);
        sweep_expired(&mut standard, now, cfg.retention(false));
        assert!(standard.get(id).is_some());

        let mut pressured = OperationRegistry::new();
        let id = finished(&mut pressured, "a", OperationStatus::Completed, now - 10 * MINUTE_MS);
        sweep_expired(&mut pressured, now, cfg.retention(true));
        assert!(pressured.get(id).is_none());
    }

    #[test]
    fn over_cap_keeps_bucket_union() {
        let cfg = CleanupConfig {
            recent_limit: 2,
            completed_limit: 3,
            error_limit: 2,
            ..CleanupConfig::default()
        };
        let mut reg = OperationRegistry::new();
        // Newest first: t=20 .. t=1, alternating completed / failed.
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for t in 1..=20u64 {
            if t % 2 == 0 {
                completed.push(finished(&mut reg, "c", OperationStatus::Completed, t));
            } else {
                failed.push(finished(&mut reg, "f", OperationStatus::Failed, t));
            }
        }
        let running = active(&mut reg, "live", 0);

        sweep_over_cap(&mut reg, 5, &cfg);

        // recent: t=20 (c), t=19 (f); completed: 20, 18, 16; failed: 19, 17.
        let mut expected: HashSet<OperationId> = HashSet::new();
        expected.extend(completed.iter().rev().take(3));
        expected.extend(failed.iter().rev().take(2));
        expected.insert(running);
        let retained: HashSet<OperationId> = reg.iter().map(Operation::id).collect();
        assert_eq!(retained, expected);
        reg.check_invariants().unwrap();
    }

    #[test]
    fn over_cap_is_noop_within_history() {
        let cfg = CleanupConfig::default();
        let mut reg = OperationRegistry::new();
        for t in 0..5 {
            finished(&mut reg, "a", OperationStatus::Completed, t);
        }
        assert_eq!(sweep_over_cap(&mut reg, 10, &cfg), 0);
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn emergency_keeps_recent_and_fresh_failures() {
        let cfg = CleanupConfig {
            emergency_recent_limit: 2,
            ..CleanupConfig::default()
        };
        let now = 100 * MINUTE_MS;
        let mut reg = OperationRegistry::new();
        let recent_a = finished(&mut reg, "a", OperationStatus::Completed, now);
        let recent_b = finished(&mut reg, "b", OperationStatus::Completed, now - 1);
        let fresh_failure = finished(&mut reg, "c", OperationStatus::Failed, now - 2 * MINUTE_MS);
        let stale_failure = finished(&mut reg, "d", OperationStatus::Failed, now - 6 * MINUTE_MS);
        let old_cancel = finished(&mut reg, "e", OperationStatus::Cancelled, now - MINUTE_MS);
        let running = active(&mut reg, "f", 0);

        sweep_emergency(&mut reg, now, &cfg);

        for kept in [recent_a, recent_b, fresh_failure, running] {
            assert!(reg.get(kept).is_some());
        }
        for gone in [stale_failure, old_cancel] {
            assert!(reg.get(gone).is_none());
        }
    }

    #[test]
    fn run_pass_sets_flags_and_reports() {
        let config = CoordinatorConfig {
            max_history: 10,
            ..CoordinatorConfig::default()
        };
        let mut reg = OperationRegistry::new();
        for t in 0..5 {
            finished(&mut reg, "a", OperationStatus::Completed, t);
        }

        let report = run_pass(&mut reg, &config, ThermalState::Critical, 1_000);
        assert!(report.under_pressure());
        assert!(!report.was_under_pressure);
        assert_eq!(report.retention, config.cleanup.pressure_retention);
        assert!(reg.under_pressure());
        assert_eq!(reg.last_cleanup_ms(), Some(1_000));
        assert_eq!(report.remaining, reg.len());

        let report = run_pass(&mut reg, &config, ThermalState::Nominal, 2_000);
        assert!(!report.under_pressure());
        assert!(report.was_under_pressure);
        assert!(!reg.under_pressure());
    }

    #[test]
    fn run_pass_escalates_when_thermal_pressure_persists() {
        let config = CoordinatorConfig::default();
        let now = 100 * MINUTE_MS;
        let mut reg = OperationRegistry::new();

        // Oldest first: failures inside the window, one outside it, a cancel,
        // then fifteen completions newer than all of them.
        let window_start = now - 4 * MINUTE_MS;
        let fresh_failures: Vec<_> = (0..3u64)
            .map(|i| {
                let entity = format!("f-{i}");
                finished(&mut reg, &entity, OperationStatus::Failed, window_start + i)
            })
            .collect();
        let stale_at = now - 5 * MINUTE_MS - 1_000;
        let stale_failure = finished(&mut reg, "stale", OperationStatus::Failed, stale_at);
        let cancelled = finished(&mut reg, "x", OperationStatus::Cancelled, window_start);
        let completed: Vec<_> = (0..15u64)
            .map(|i| {
                let at = now - 3 * MINUTE_MS + i * 1_000;
                finished(&mut reg, &format!("c-{i}"), OperationStatus::Completed, at)
            })
            .collect();
        let running = active(&mut reg, "live", 0);

        let report = run_pass(&mut reg, &config, ThermalState::Critical, now);

        assert!(report.under_pressure());
        assert_eq!(report.removed_over_cap, 0);
        // The stale failure is older than the pressure retention.
        assert_eq!(report.removed_expired, 1);
        assert!(reg.get(stale_failure).is_none());
        // Newest ten completions, the in-window failures and the live capture.
        assert_eq!(report.removed_emergency, 6);
        assert_eq!(report.remaining, 10 + 3 + 1);
        for id in completed.iter().rev().take(10).chain(&fresh_failures) {
            assert!(reg.get(*id).is_some());
        }
        for id in completed.iter().take(5).chain([&cancelled]) {
            assert!(reg.get(*id).is_none());
        }
        assert!(reg.get(running).is_some());
        reg.check_invariants().unwrap();
    }

    #[test]
    fn run_pass_escalates_when_count_pressure_survives_the_count_sweep() {
        let config = CoordinatorConfig {
            max_history: 20,
            ..CoordinatorConfig::default()
        };
        let now = 100 * MINUTE_MS;
        let mut reg = OperationRegistry::new();
        // Thirty completions fit the completed bucket, so the count sweep
        // keeps them all and the ratio stays above the threshold.
        for i in 0..30u64 {
            let at = now - MINUTE_MS + i;
            finished(&mut reg, &format!("c-{i}"), OperationStatus::Completed, at);
        }

        let report = run_pass(&mut reg, &config, ThermalState::Nominal, now);

        assert!(report.under_pressure());
        assert_eq!(report.removed_expired, 0);
        assert_eq!(report.removed_over_cap, 0);
        assert_eq!(report.removed_emergency, 20);
        assert_eq!(reg.len(), config.cleanup.emergency_recent_limit);
    }

    #[test]
    fn run_pass_skips_emergency_once_count_sweep_relieves_pressure() {
        let config = CoordinatorConfig {
            max_history: 20,
            cleanup: CleanupConfig {
                recent_limit: 5,
                completed_limit: 5,
                error_limit: 5,
                ..CleanupConfig::default()
            },
            ..CoordinatorConfig::default()
        };
        let now = 100 * MINUTE_MS;
        let mut reg = OperationRegistry::new();
        for i in 0..30u64 {
            let at = now - MINUTE_MS + i;
            finished(&mut reg, &format!("c-{i}"), OperationStatus::Completed, at);
        }
        let running = active(&mut reg, "live", 0);

        let report = run_pass(&mut reg, &config, ThermalState::Nominal, now);

        assert!(report.under_pressure());
        assert_eq!(report.removed_over_cap, 25);
        assert_eq!(report.removed_emergency, 0);
        assert_eq!(reg.len(), 6);
        assert!(reg.get(running).is_some());
    }

    #[test]
    fn log_report_records_transitions() {
        let log = MemoryLogSink::new();
        let mut report = SweepReport {
            ran_at_ms: 0,
            pressure: PressureReading {
                ratio: 0.9,
                thermal: ThermalState::Nominal,
                under_pressure: true,
            },
            was_under_pressure: false,
            retention: Duration::from_secs(300),
            removed_expired: 2,
            removed_over_cap: 0,
            removed_emergency: 1,
            remaining: 7,
        };
        log_report(&log, &report);
        assert_eq!(log.matching(LogLevel::Warn, "pressure").len(), 1);
        let sweeps = log.matching(LogLevel::Info, "cleanup");
        assert_eq!(sweeps.len(), 1);
        assert_eq!(sweeps[0].field("remaining"), Some("7"));
        assert_eq!(sweeps[0].field("under_pressure"), Some("true"));

        log.clear();
        report.was_under_pressure = true;
        log_report(&log, &report);
        assert!(log.matching(LogLevel::Warn, "pressure").is_empty());
    }

    fn status_strategy() -> impl Strategy<Value = OperationStatus> {
        prop_oneof![
            Just(OperationStatus::Pending),
            Just(OperationStatus::Active),
            Just(OperationStatus::Completed),
            Just(OperationStatus::Failed),
            Just(OperationStatus::Cancelled),
        ]
    }

    proptest! {
        #[test]
        fn sweeps_never_remove_in_flight(
            ops in proptest::collection::vec((status_strategy(), 0u64..10_000_000), 0..80),
            max_history in 1usize..40,
            thermal_hot in any::<bool>(),
        ) {
            let config = CoordinatorConfig {
                max_history,
                cleanup: CleanupConfig {
                    recent_limit: 3,
                    completed_limit: 4,
                    error_limit: 2,
                    ..CleanupConfig::default()
                },
                ..CoordinatorConfig::default()
            };
            let mut reg = OperationRegistry::new();
            let mut in_flight = Vec::new();
            for (i, (status, at)) in ops.iter().enumerate() {
                let entity = format!("memo-{i}");
                match status {
                    OperationStatus::Pending => {
                        in_flight.push(reg.insert_pending(Operation::new(
                            OperationType::analysis(entity),
                            Priority::Low,
                            *at,
                        )));
                    }
                    OperationStatus::Active => in_flight.push(active(&mut reg, &entity, *at)),
                    other => {
                        finished(&mut reg, &entity, *other, *at);
                    }
                }
            }
            let thermal = if thermal_hot { ThermalState::Critical } else { ThermalState::Nominal };

            let report = run_pass(&mut reg, &config, thermal, 10_000_000);

            for id in &in_flight {
                prop_assert!(reg.get(*id).is_some());
            }
            if report.removed_over_cap > 0 {
                let finished_left = reg.iter().filter(|op| op.is_terminal()).count();
                prop_assert!(finished_left <= 3 + 4 + 2);
            }
            reg.check_invariants().unwrap();
        }
    }
}
