//! opcoord core: operation model, conflict table and clock sources shared by
//! the coordinator and its owning services.

pub mod clock;
pub mod conflict;
pub mod operation;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use conflict::{conflict_between, first_conflict, ConflictKind};
pub use operation::{
    Category, EntityId, Operation, OperationId, OperationStatus, OperationSummary, OperationType,
    Priority, Progress,
};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
