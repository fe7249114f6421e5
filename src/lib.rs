pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::calendar_sync::{
    ConflictRecord, ConflictResolution, ItemFailure, SyncCancellation, SyncResult,
};
pub use application::engine::{Engine, EngineComponents, ProductionEngine};
pub use application::expansion_scheduler::{SchedulerHandle, SweepReport};
pub use domain::models::{
    ItemKind, ItemSource, Recurrence, RecurrenceMode, RecurrencePattern, RecurrenceRule,
    RemoteItem, ScheduleItem, Termination,
};
pub use domain::recurrence::{ExpansionPlan, ExpansionPolicy, expand};
pub use infrastructure::error::{EngineError, ErrorCategory};
