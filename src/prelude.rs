// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use corral::prelude::*;` to get started quickly.

pub use crate::admission::{
    AdmissionConfig, AdmissionController, AdmissionStats, FileLock, Ledger, LedgerStore,
    LockConfig, LockGuard, Reaper, ReaperConfig, ResourceEntry, SlotDecision, WorkerEntry,
};
pub use crate::error::{CorralError, LedgerError, LockError};
pub use crate::identity::WorkerIdentity;
pub use crate::scheduler::{
    AttemptOutcome, BatchRun, ControlSignal, HaltReason, Scheduler, SchedulerConfig, TaskReport,
    TaskState, WorkExecutor,
};
