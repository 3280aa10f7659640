//! The operation coordinator: one instance per process, built at the
//! composition root and shared by reference with the capture, transcription
//! and analysis services.
//!
//! All registry state sits behind a single `parking_lot::Mutex`. Every public
//! call takes the lock for exactly one bookkeeping step. Status changes are
//! queued for the status delegate before the lock is released, so the
//! delegate sees them in registry order; logging happens after release. The
//! cleanup loop runs on a [`BackgroundWorker`] and only locks while a sweep
//! is in progress.

pub(crate) mod admission;
pub mod cleanup;
pub mod metrics;
pub mod registry;
pub(crate) mod scheduler;

use std::sync::Arc;

use opcoord_core::{
    Category, ClockSource, EntityId, Operation, OperationId, OperationStatus, OperationSummary,
    OperationType, Priority, Progress, SystemClock,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use self::admission::StartRejection;
use self::cleanup::{CleanupEngine, CleanupTask, SweepReport};
use self::metrics::{CategoryGroup, OperationMetrics, StatusFilter, SystemMetrics};
use self::registry::{InvariantViolation, OperationRegistry, Outcome};
use crate::config::CoordinatorConfig;
use crate::delegate::{StatusDelegate, StatusNotifier};
use crate::error::{ConfigError, RegisterError};
use crate::log::{LogField, LogLevel, LogSink, TracingLogSink};
use crate::thermal::{NominalThermal, ThermalSource};
use crate::worker::BackgroundWorker;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Host-provided collaborators. `Default` gives the system clock, the
/// `tracing` log sink and a thermal source that is always nominal.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn ClockSource>,
    pub log: Arc<dyn LogSink>,
    pub thermal: Arc<dyn ThermalSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            log: Arc::new(TracingLogSink),
            thermal: Arc::new(NominalThermal),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the coordinator handle and its cleanup loop.
pub(crate) struct Shared {
    registry: Mutex<OperationRegistry>,
    config: CoordinatorConfig,
    clock: Arc<dyn ClockSource>,
    log: Arc<dyn LogSink>,
    thermal: Arc<dyn ThermalSource>,
    notifier: StatusNotifier,
}

impl Shared {
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Runs `f` under the registry lock and checks the index invariants
    /// afterwards in debug builds.
    fn mutate<T>(&self, f: impl FnOnce(&mut OperationRegistry) -> T) -> T {
        let mut registry = self.registry.lock();
        let out = f(&mut *registry);
        debug_assert!(
            registry.check_invariants().is_ok(),
            "registry invariant violated: {:?}",
            registry.check_invariants()
        );
        out
    }

    /// [`mutate`](Self::mutate) for calls that change status. `f` returns its
    /// result plus the changed operations, which are queued for the status
    /// delegate before the lock is released.
    fn mutate_notify<T>(
        &self,
        f: impl FnOnce(&mut OperationRegistry) -> (T, Vec<Operation>),
    ) -> (T, Vec<Operation>) {
        let (out, changes, rejected) = self.mutate(|registry| {
            let (out, changes) = f(registry);
            let rejected = self.notifier.enqueue(&changes);
            (out, changes, rejected)
        });
        self.notifier.deliver_now(&rejected);
        (out, changes)
    }

    fn read<T>(&self, f: impl FnOnce(&OperationRegistry) -> T) -> T {
        f(&*self.registry.lock())
    }

    fn log(&self, level: LogLevel, category: &'static str, message: &str, fields: &[LogField]) {
        self.log.log(level, category, message, fields);
    }

    /// One cleanup pass: sweep under the lock, then publish gauges and log.
    pub(crate) fn run_cleanup(&self) -> SweepReport {
        let thermal = self.thermal.thermal_state();
        let now = self.now();
        let report = self.mutate(|registry| {
            let report = cleanup::run_pass(registry, &self.config, thermal, now);
            metrics::publish(registry);
            report
        });
        cleanup::log_report(self.log.as_ref(), &report);
        report
    }

    fn log_admitted(&self, admitted: &[Operation]) {
        for op in admitted {
            self.log(
                LogLevel::Debug,
                "scheduler",
                "pending operation admitted",
                &[
                    ("operation_id", op.id().to_string()),
                    ("category", op.category().as_str().to_string()),
                    ("entity", op.entity().to_string()),
                ],
            );
        }
    }
}

// ---------------------------------------------------------------------------
// OperationCoordinator
// ---------------------------------------------------------------------------

/// Central admission, scheduling and cleanup authority for long-running
/// per-recording work.
pub struct OperationCoordinator {
    shared: Arc<Shared>,
    cleanup: Mutex<Option<BackgroundWorker<CleanupEngine>>>,
}

impl OperationCoordinator {
    /// Creates a coordinator with default collaborators.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn new(config: CoordinatorConfig) -> Result<Self, ConfigError> {
        Self::with_collaborators(config, Collaborators::default())
    }

    /// Creates a coordinator with host-provided collaborators.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` fails validation.
    pub fn with_collaborators(
        config: CoordinatorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let Collaborators {
            clock,
            log,
            thermal,
        } = collaborators;
        let notifier = StatusNotifier::new(Arc::clone(&log));
        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(OperationRegistry::new()),
                config,
                clock,
                log,
                thermal,
                notifier,
            }),
            cleanup: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    // -- lifecycle ----------------------------------------------------------

    /// Registers a new operation and admits it straight away when the
    /// conflict table and the concurrency ceiling allow. Otherwise it waits
    /// in the FIFO queue until the scheduler admits it.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError`] if the entity id is blank or the conflict
    /// table forbids the operation. Nothing is recorded in that case.
    pub fn register(
        &self,
        op_type: OperationType,
        priority: Priority,
    ) -> Result<OperationId, RegisterError> {
        let now = self.shared.now();
        let limit = self.shared.config.max_concurrent_operations;
        let category = op_type.category();
        let entity = op_type.entity().clone();
        let (result, admitted) = self.shared.mutate_notify(
            |registry| -> (Result<OperationId, RegisterError>, Vec<Operation>) {
                if let Err(err) = admission::check_register(registry, &op_type) {
                    return (Err(err), Vec::new());
                }
                let id = registry.insert_pending(Operation::new(op_type, priority, now));
                (Ok(id), scheduler::admit_pending(registry, limit, now))
            },
        );

        match &result {
            Ok(id) => {
                let queued = admitted.iter().all(|op| op.id() != *id);
                self.shared.log(
                    LogLevel::Debug,
                    "admission",
                    "operation registered",
                    &[
                        ("operation_id", id.to_string()),
                        ("category", category.as_str().to_string()),
                        ("entity", entity.to_string()),
                        ("priority", priority.as_str().to_string()),
                        ("queued", queued.to_string()),
                    ],
                );
                self.shared.log_admitted(&admitted);
            }
            Err(err) => self.shared.log(
                LogLevel::Info,
                "admission",
                "registration rejected",
                &[
                    ("category", category.as_str().to_string()),
                    ("entity", entity.to_string()),
                    ("reason", err.to_string()),
                ],
            ),
        }
        result
    }

    /// Moves a pending operation to active if the conflict table and the
    /// concurrency ceiling allow it. Returns whether the operation is active
    /// afterwards: true if it already was (registration usually admits
    /// straight away), false if it stays pending or is unknown or finished.
    pub fn start(&self, id: OperationId) -> bool {
        let now = self.shared.now();
        let limit = self.shared.config.max_concurrent_operations;
        let (result, _) = self.shared.mutate_notify(|registry| {
            match admission::try_start(registry, id, limit, now) {
                Ok(op) => (Ok(op.clone()), vec![op]),
                Err(rejection) => (Err(rejection), Vec::new()),
            }
        });

        match result {
            Ok(op) => {
                self.shared.log(
                    LogLevel::Debug,
                    "admission",
                    "operation started",
                    &[
                        ("operation_id", id.to_string()),
                        ("category", op.category().as_str().to_string()),
                        ("entity", op.entity().to_string()),
                    ],
                );
                true
            }
            Err(StartRejection::NotPending(OperationStatus::Active)) => true,
            Err(rejection) => {
                self.log_start_rejection(id, &rejection);
                false
            }
        }
    }

    /// Pending or active -> completed. Returns whether the transition was
    /// applied.
    pub fn complete(&self, id: OperationId) -> bool {
        self.finish(id, Outcome::Completed)
    }

    /// Pending or active -> failed, recording `reason` verbatim.
    pub fn fail(&self, id: OperationId, reason: impl Into<String>) -> bool {
        self.finish(id, Outcome::Failed(reason.into()))
    }

    /// Pending or active -> cancelled.
    ///
    /// Cancellation is bookkeeping only: the owning service notices it by
    /// polling [`status`](Self::status) and stops its own work.
    pub fn cancel(&self, id: OperationId) -> bool {
        self.finish(id, Outcome::Cancelled)
    }

    /// Replaces the progress of an active operation. Ignored otherwise.
    pub fn update_progress(&self, id: OperationId, progress: Progress) -> bool {
        let applied = self
            .shared
            .mutate(|registry| registry.set_progress(id, progress));
        if !applied {
            self.shared.log(
                LogLevel::Debug,
                "admission",
                "progress update ignored",
                &[("operation_id", id.to_string())],
            );
        }
        applied
    }

    /// Cancels every non-terminal operation. Returns the number cancelled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_matching("all", |_| true)
    }

    /// Cancels every non-terminal operation on `entity`.
    pub fn cancel_all_for_entity(&self, entity: &EntityId) -> usize {
        self.cancel_matching("entity", |op| op.entity() == entity)
    }

    /// Cancels every non-terminal operation of `category`.
    pub fn cancel_all_in_category(&self, category: Category) -> usize {
        self.cancel_matching("category", |op| op.category() == category)
    }

    // -- queries ------------------------------------------------------------

    /// True if an operation of `category` is currently active on `entity`.
    #[must_use]
    pub fn is_active(&self, category: Category, entity: &EntityId) -> bool {
        self.shared
            .read(|registry| registry.is_active(category, entity))
    }

    /// True if `register` would accept an operation of `category` on
    /// `entity` right now.
    #[must_use]
    pub fn can_admit(&self, category: Category, entity: &EntityId) -> bool {
        self.shared
            .read(|registry| admission::can_admit(registry, category, entity))
    }

    /// Active operations, oldest start first.
    #[must_use]
    pub fn active_operations(&self) -> Vec<Operation> {
        self.shared.read(|registry| {
            let mut ops: Vec<Operation> = registry
                .iter()
                .filter(|op| op.status() == OperationStatus::Active)
                .cloned()
                .collect();
            ops.sort_by_key(|op| (op.started_at_ms(), op.id()));
            ops
        })
    }

    /// Active operations on `entity`, oldest start first.
    #[must_use]
    pub fn active_operations_for(&self, entity: &EntityId) -> Vec<Operation> {
        self.shared.read(|registry| {
            let mut ops: Vec<Operation> = registry
                .active_ids_for(entity)
                .filter_map(|id| registry.get(id).cloned())
                .collect();
            ops.sort_by_key(|op| (op.started_at_ms(), op.id()));
            ops
        })
    }

    /// Pending operations in FIFO order.
    #[must_use]
    pub fn pending_operations(&self) -> Vec<Operation> {
        self.shared.read(|registry| {
            registry
                .pending_ids()
                .filter_map(|id| registry.get(id).cloned())
                .collect()
        })
    }

    #[must_use]
    pub fn operation(&self, id: OperationId) -> Option<Operation> {
        self.shared.read(|registry| registry.get(id).cloned())
    }

    #[must_use]
    pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
        self.shared
            .read(|registry| registry.get(id).map(Operation::status))
    }

    /// Zero-based position among pending operations, or `None` if `id` is not
    /// pending.
    #[must_use]
    pub fn queue_position(&self, id: OperationId) -> Option<usize> {
        self.shared.read(|registry| registry.queue_position(id))
    }

    /// Runs the queue scheduler now. Returns the ids it started.
    pub fn try_admit_pending(&self) -> Vec<OperationId> {
        let now = self.shared.now();
        let limit = self.shared.config.max_concurrent_operations;
        let ((), admitted) = self
            .shared
            .mutate_notify(|registry| ((), scheduler::admit_pending(registry, limit, now)));
        self.shared.log_admitted(&admitted);
        admitted.iter().map(Operation::id).collect()
    }

    // -- metrics & introspection --------------------------------------------

    #[must_use]
    pub fn metrics(&self) -> OperationMetrics {
        self.shared.read(metrics::collect)
    }

    #[must_use]
    pub fn system_metrics(&self) -> SystemMetrics {
        self.shared
            .read(|registry| metrics::collect_system(registry, &self.shared.config))
    }

    /// Read projections filtered by category group, status group and
    /// optionally entity, newest first.
    #[must_use]
    pub fn summaries(
        &self,
        group: CategoryGroup,
        filter: StatusFilter,
        entity: Option<&EntityId>,
    ) -> Vec<OperationSummary> {
        self.shared
            .read(|registry| metrics::summaries(registry, group, filter, entity))
    }

    #[must_use]
    pub fn debug_dump(&self) -> String {
        self.shared
            .read(|registry| metrics::debug_dump(registry, &self.shared.config))
    }

    /// Publishes the current gauges through the `metrics` facade.
    pub fn publish_metrics(&self) {
        self.shared.read(metrics::publish);
    }

    /// Installs the single status delegate, replacing any previous one.
    /// `None` uninstalls.
    pub fn set_status_delegate(&self, delegate: Option<Arc<dyn StatusDelegate>>) {
        self.shared.notifier.set(delegate);
    }

    // -- cleanup --------------------------------------------------------------

    /// Runs one cleanup pass on the calling thread.
    pub fn run_cleanup_now(&self) -> SweepReport {
        self.shared.run_cleanup()
    }

    /// Starts the periodic cleanup loop, replacing (and stopping) any loop
    /// already running. Must be called inside a Tokio runtime.
    pub async fn start_cleanup(&self) {
        let engine = CleanupEngine::new(Arc::clone(&self.shared));
        let previous = self.cleanup.lock().replace(BackgroundWorker::start(engine));
        if let Some(mut previous) = previous {
            previous.stop().await;
        }
        self.shared
            .log(LogLevel::Debug, "cleanup", "cleanup loop started", &[]);
    }

    /// Stops the cleanup loop. Idempotent.
    pub async fn stop_cleanup(&self) {
        let worker = self.cleanup.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
    }

    /// Asks the running cleanup loop for an immediate pass.
    ///
    /// # Errors
    ///
    /// Fails if the loop is not running or stops before replying.
    pub async fn request_cleanup(&self) -> anyhow::Result<SweepReport> {
        let sender = self
            .cleanup
            .lock()
            .as_ref()
            .and_then(BackgroundWorker::sender)
            .ok_or_else(|| anyhow::anyhow!("cleanup loop not running"))?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(CleanupTask::RunNow(tx))
            .await
            .map_err(|_| anyhow::anyhow!("cleanup loop channel closed"))?;
        Ok(rx.await?)
    }

    #[must_use]
    pub fn is_cleanup_running(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .is_some_and(BackgroundWorker::is_running)
    }

    #[must_use]
    pub fn is_under_pressure(&self) -> bool {
        self.shared.read(OperationRegistry::under_pressure)
    }

    /// Time of the last cleanup pass, in milliseconds since the epoch.
    #[must_use]
    pub fn last_cleanup_time_ms(&self) -> Option<u64> {
        self.shared.read(OperationRegistry::last_cleanup_ms)
    }

    /// Verifies the registry's index invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violation found. Any error is a defect.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.shared.read(OperationRegistry::check_invariants)
    }

    // -- internals ------------------------------------------------------------

    fn finish(&self, id: OperationId, outcome: Outcome) -> bool {
        let now = self.shared.now();
        let limit = self.shared.config.max_concurrent_operations;
        let requested = outcome.status();

        let (result, changes) = self.shared.mutate_notify(|registry| {
            let prior = registry.get(id).map(Operation::status);
            match registry.finish(id, outcome, now) {
                Some(op) => {
                    let mut changes = vec![op.clone()];
                    changes.extend(scheduler::admit_pending(registry, limit, now));
                    (Ok(op), changes)
                }
                None => (Err(prior), Vec::new()),
            }
        });

        match result {
            Ok(op) => {
                let mut fields = vec![
                    ("operation_id", id.to_string()),
                    ("status", op.status().as_str().to_string()),
                    ("category", op.category().as_str().to_string()),
                    ("entity", op.entity().to_string()),
                ];
                if let Some(duration) = op.execution_duration() {
                    fields.push(("duration_ms", duration.as_millis().to_string()));
                }
                if let Some(reason) = op.error_description() {
                    fields.push(("error", reason.to_string()));
                }
                self.shared
                    .log(LogLevel::Debug, "admission", "operation finished", &fields);
                self.shared.log_admitted(&changes[1..]);
                true
            }
            Err(prior) => {
                let message = if prior.is_some() {
                    "operation already finished"
                } else {
                    "unknown operation"
                };
                let current = prior.map_or("none", OperationStatus::as_str);
                self.shared.log(
                    LogLevel::Warn,
                    "admission",
                    message,
                    &[
                        ("operation_id", id.to_string()),
                        ("requested", requested.as_str().to_string()),
                        ("current", current.to_string()),
                    ],
                );
                false
            }
        }
    }

    fn cancel_matching(&self, scope: &'static str, predicate: impl Fn(&Operation) -> bool) -> usize {
        let now = self.shared.now();
        let limit = self.shared.config.max_concurrent_operations;

        let (count, changes) = self.shared.mutate_notify(|registry| {
            let mut targets: Vec<(u64, OperationId)> = registry
                .iter()
                .filter(|op| !op.is_terminal() && predicate(op))
                .map(|op| (op.created_at_ms(), op.id()))
                .collect();
            targets.sort_unstable();
            let mut changes: Vec<Operation> = targets
                .into_iter()
                .filter_map(|(_, id)| registry.finish(id, Outcome::Cancelled, now))
                .collect();
            let count = changes.len();
            if count > 0 {
                changes.extend(scheduler::admit_pending(registry, limit, now));
            }
            (count, changes)
        });

        if count > 0 {
            self.shared.log(
                LogLevel::Info,
                "admission",
                "bulk cancel",
                &[("scope", scope.to_string()), ("cancelled", count.to_string())],
            );
        }
        self.shared.log_admitted(&changes[count..]);
        count
    }

    fn log_start_rejection(&self, id: OperationId, rejection: &StartRejection) {
        let level = if rejection.is_caller_error() {
            LogLevel::Warn
        } else {
            LogLevel::Debug
        };
        self.shared.log(
            level,
            "admission",
            "start refused",
            &[
                ("operation_id", id.to_string()),
                ("reason", rejection.describe()),
            ],
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
