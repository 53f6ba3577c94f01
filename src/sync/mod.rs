pub mod breach;
pub mod orchestrator;
pub mod reconciler;

pub use breach::{evaluate_breaches, BreachDetector};
pub use orchestrator::{
    BatchError, SensorOutcome, SensorSyncError, SkipReason, SyncErrorKind, SyncOrchestrator,
    SyncReport,
};
pub use reconciler::{count_new_logs, reconstruct_timestamps, ReconcileError};
