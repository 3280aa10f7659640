//! Error types surfaced by the coordinator.
//!
//! Admission denials are ordinary values, not failures of the coordinator:
//! `register` returns [`RegisterError`] and the caller decides whether to
//! show it to the user.

use opcoord_core::{Category, ConflictKind, EntityId, OperationId};

/// Why `register` refused to create an operation. No state is changed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("operation has no entity id")]
    MissingEntity,
    #[error("{category} for {entity} rejected: {kind} (blocked by {blocking_category} {blocking_id})")]
    Conflict {
        category: Category,
        entity: EntityId,
        kind: ConflictKind,
        blocking_category: Category,
        blocking_id: OperationId,
    },
}

/// Invalid [`CoordinatorConfig`](crate::config::CoordinatorConfig) values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("pressure_ratio must be in (0, 1], got {0}")]
    PressureRatio(f64),
    #[error("pressure_retention ({pressure:?}) must not exceed standard_retention ({standard:?})")]
    RetentionOrder {
        pressure: std::time::Duration,
        standard: std::time::Duration,
    },
    #[error("pressure_interval ({pressure:?}) must not exceed standard_interval ({standard:?})")]
    IntervalOrder {
        pressure: std::time::Duration,
        standard: std::time::Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_both_operations() {
        let blocking_id = OperationId::new();
        let err = RegisterError::Conflict {
            category: Category::Transcription,
            entity: EntityId::from("memo-7"),
            kind: ConflictKind::CaptureInProgress,
            blocking_category: Category::Capture,
            blocking_id,
        };
        let text = err.to_string();
        assert!(text.contains("transcription for memo-7 rejected"));
        assert!(text.contains("still being captured"));
        assert!(text.contains(&blocking_id.to_string()));
    }

    #[test]
    fn config_error_messages() {
        assert_eq!(
            ConfigError::Zero { field: "max_history" }.to_string(),
            "max_history must be greater than zero"
        );
        assert!(ConfigError::PressureRatio(1.5).to_string().contains("1.5"));
    }
}
