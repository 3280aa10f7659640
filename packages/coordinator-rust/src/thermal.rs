//! Host thermal / resource signal consumed by the pressure monitor.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Coarse host thermal state, ordered from coolest to hottest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Fair => "fair",
            Self::Serious => "serious",
            Self::Critical => "critical",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Nominal,
            1 => Self::Fair,
            2 => Self::Serious,
            _ => Self::Critical,
        }
    }
}

/// Source of the host's current thermal state.
pub trait ThermalSource: Send + Sync {
    fn thermal_state(&self) -> ThermalState;
}

/// Always reports [`ThermalState::Nominal`]. Used when the host has no signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NominalThermal;

impl ThermalSource for NominalThermal {
    fn thermal_state(&self) -> ThermalState {
        ThermalState::Nominal
    }
}

/// Thermal state the host pushes into as it changes.
#[derive(Debug, Default)]
pub struct SharedThermal {
    state: AtomicU8,
}

impl SharedThermal {
    #[must_use]
    pub fn new(initial: ThermalState) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
        }
    }

    pub fn set(&self, state: ThermalState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

impl ThermalSource for SharedThermal {
    fn thermal_state(&self) -> ThermalState {
        ThermalState::from_u8(self.state.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(ThermalState::Nominal < ThermalState::Fair);
        assert!(ThermalState::Fair < ThermalState::Serious);
        assert!(ThermalState::Serious < ThermalState::Critical);
    }

    #[test]
    fn shared_thermal_roundtrips_every_state() {
        let thermal = SharedThermal::default();
        assert_eq!(thermal.thermal_state(), ThermalState::Nominal);
        for state in [
            ThermalState::Fair,
            ThermalState::Serious,
            ThermalState::Critical,
            ThermalState::Nominal,
        ] {
            thermal.set(state);
            assert_eq!(thermal.thermal_state(), state);
        }
    }
}
