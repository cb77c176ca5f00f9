// ABOUTME: Admission module - filesystem-mediated global concurrency control.
// ABOUTME: Contains the cross-process lock, the shared ledger, the controller, and the reaper.

mod controller;
mod ledger;
mod lock;
mod reaper;

pub use controller::{AdmissionConfig, AdmissionController, AdmissionStats, SlotDecision};
pub use ledger::{Ledger, LedgerStore, ResourceEntry, WorkerEntry};
pub use lock::{FileLock, LockConfig, LockGuard};
pub use reaper::{Reaper, ReaperConfig};

/// Name of the lock token that serializes every ledger mutation.
pub(crate) const LEDGER_LOCK_NAME: &str = "ledger";

#[cfg(test)]
mod controller_test;
#[cfg(test)]
mod lock_test;
