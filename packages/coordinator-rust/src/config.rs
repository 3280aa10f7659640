//! Coordinator configuration.
//!
//! Controls the concurrency ceiling, the history cap, and the cleanup
//! engine's intervals, retention thresholds and per-bucket limits.

use std::time::Duration;

use crate::error::ConfigError;
use crate::thermal::ThermalState;

/// Top-level configuration for an [`OperationCoordinator`](crate::OperationCoordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of operations that may be `Active` at once.
    pub max_concurrent_operations: usize,
    /// Total operations (any status) kept before the count-based sweep runs.
    /// Also the denominator of the pressure ratio.
    pub max_history: usize,
    /// Cleanup engine settings.
    pub cleanup: CleanupConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 3,
            max_history: 100,
            cleanup: CleanupConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Checks the values for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_operations == 0 {
            return Err(ConfigError::Zero {
                field: "max_concurrent_operations",
            });
        }
        if self.max_history == 0 {
            return Err(ConfigError::Zero {
                field: "max_history",
            });
        }
        self.cleanup.validate()
    }
}

/// Memory-pressure monitor and cleanup engine settings.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Delay between cleanup passes when not under pressure.
    pub standard_interval: Duration,
    /// Delay between cleanup passes while under pressure.
    pub pressure_interval: Duration,
    /// Maximum age of a finished operation when not under pressure.
    pub standard_retention: Duration,
    /// Maximum age of a finished operation while under pressure.
    pub pressure_retention: Duration,
    /// `operations / max_history` above which the registry is under pressure.
    pub pressure_ratio: f64,
    /// Thermal state at or above which the host is under pressure.
    pub thermal_threshold: ThermalState,
    /// Count sweep: most recent finished operations kept regardless of status.
    pub recent_limit: usize,
    /// Count sweep: most recent completed operations kept.
    pub completed_limit: usize,
    /// Count sweep: most recent failed or cancelled operations kept.
    pub error_limit: usize,
    /// Emergency sweep: most recent finished operations kept.
    pub emergency_recent_limit: usize,
    /// Emergency sweep: failures newer than this are kept.
    pub emergency_failure_window: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            standard_interval: Duration::from_secs(60),
            pressure_interval: Duration::from_secs(10),
            standard_retention: Duration::from_secs(60 * 60),
            pressure_retention: Duration::from_secs(5 * 60),
            pressure_ratio: 0.8,
            thermal_threshold: ThermalState::Serious,
            recent_limit: 20,
            completed_limit: 30,
            error_limit: 20,
            emergency_recent_limit: 10,
            emergency_failure_window: Duration::from_secs(5 * 60),
        }
    }
}

impl CleanupConfig {
    /// Retention threshold for the given pressure state.
    #[must_use]
    pub fn retention(&self, under_pressure: bool) -> Duration {
        if under_pressure {
            self.pressure_retention
        } else {
            self.standard_retention
        }
    }

    /// Delay before the next cleanup pass for the given pressure state.
    #[must_use]
    pub fn interval(&self, under_pressure: bool) -> Duration {
        if under_pressure {
            self.pressure_interval
        } else {
            self.standard_interval
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.standard_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "standard_interval",
            });
        }
        if self.pressure_interval.is_zero() {
            return Err(ConfigError::Zero {
                field: "pressure_interval",
            });
        }
        if !(self.pressure_ratio > 0.0 && self.pressure_ratio <= 1.0) {
            return Err(ConfigError::PressureRatio(self.pressure_ratio));
        }
        if self.pressure_retention > self.standard_retention {
            return Err(ConfigError::RetentionOrder {
                pressure: self.pressure_retention,
                standard: self.standard_retention,
            });
        }
        if self.pressure_interval > self.standard_interval {
            return Err(ConfigError::IntervalOrder {
                pressure: self.pressure_interval,
                standard: self.standard_interval,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_config_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_concurrent_operations, 3);
        assert_eq!(config.max_history, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cleanup_config_defaults() {
        let config = CleanupConfig::default();
        assert_eq!(config.standard_interval, Duration::from_secs(60));
        assert_eq!(config.pressure_interval, Duration::from_secs(10));
        assert_eq!(config.standard_retention, Duration::from_secs(3_600));
        assert_eq!(config.pressure_retention, Duration::from_secs(300));
        assert_eq!(config.thermal_threshold, ThermalState::Serious);
        assert_eq!(config.emergency_recent_limit, 10);
    }

    #[test]
    fn pressure_shortens_retention_and_interval() {
        let config = CleanupConfig::default();
        assert!(config.retention(true) < config.retention(false));
        assert!(config.interval(true) < config.interval(false));
    }

    #[test]
    fn zero_caps_rejected() {
        let config = CoordinatorConfig {
            max_concurrent_operations: 0,
            ..CoordinatorConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_concurrent_operations"
            })
        );

        let config = CoordinatorConfig {
            max_history: 0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_ratio_rejected() {
        let mut config = CoordinatorConfig::default();
        config.cleanup.pressure_ratio = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::PressureRatio(0.0)));
        config.cleanup.pressure_ratio = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_retention_rejected() {
        let mut config = CoordinatorConfig::default();
        config.cleanup.pressure_retention = Duration::from_secs(7_200);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetentionOrder { .. })
        ));
    }
}
