// ABOUTME: Scheduler module - concurrent batch execution with cooperative early exit.
// ABOUTME: Contains the outcome model, the executor boundary, and the batch runner.

mod executor;
mod outcome;
mod runner;

pub use executor::WorkExecutor;
pub use outcome::{AttemptOutcome, BatchRun, ControlSignal, HaltReason, TaskReport, TaskState};
pub use runner::{Scheduler, SchedulerConfig};
