//! opcoord coordinator: admission control, FIFO scheduling, pressure-driven
//! cleanup and metrics for long-running per-recording work.

pub mod config;
pub mod coordinator;
pub mod delegate;
pub mod error;
pub mod log;
pub mod thermal;
pub mod worker;

pub use config::{CleanupConfig, CoordinatorConfig};
pub use coordinator::cleanup::{CleanupEngine, CleanupTask, PressureReading, SweepReport};
pub use coordinator::metrics::{CategoryGroup, OperationMetrics, StatusFilter, SystemMetrics};
pub use coordinator::registry::InvariantViolation;
pub use coordinator::{Collaborators, OperationCoordinator};
pub use delegate::StatusDelegate;
pub use error::{ConfigError, RegisterError};
pub use log::{LogLevel, LogSink, MemoryLogSink, NoopLogSink, TracingLogSink};
pub use thermal::{NominalThermal, SharedThermal, ThermalSource, ThermalState};
