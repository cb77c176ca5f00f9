// ABOUTME: AdmissionController - cross-process slot accounting bounded by a global maximum.
// ABOUTME: Every mutation runs under the ledger lock and degrades to an estimate when it cannot.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::LEDGER_LOCK_NAME;
use super::ledger::{LedgerStore, ResourceEntry};
use super::lock::{FileLock, LockConfig, LockGuard};
use super::reaper::{Reaper, ReaperConfig};
use crate::error::{CorralError, LockError};
use crate::identity::WorkerIdentity;

/// Tunables for the admission controller.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Global ceiling on concurrently held slots.
    pub max_sessions: u32,

    /// Lock acquisition behavior for ledger operations.
    pub lock: LockConfig,

    /// Lock timeout for the first counter-mutation attempt; each retry
    /// gets one more multiple of this, so the last attempt waits the
    /// longest.
    pub mutation_timeout: Duration,

    /// Counter-mutation attempts before degrading to an estimate.
    pub mutation_retries: u32,

    /// Lock timeout for best-effort resource registration.
    pub registration_timeout: Duration,

    /// First delay between availability polls in `wait_for_slot`.
    pub poll_base: Duration,

    /// Added to the poll delay for every unavailable poll.
    pub poll_step: Duration,

    /// Ceiling for the poll delay.
    pub poll_cap: Duration,

    /// Internal errors tolerated in `wait_for_slot` before failing open.
    pub fail_open_after: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            lock: LockConfig::default(),
            mutation_timeout: Duration::from_secs(5),
            mutation_retries: 3,
            registration_timeout: Duration::from_secs(2),
            poll_base: Duration::from_millis(500),
            poll_step: Duration::from_millis(250),
            poll_cap: Duration::from_secs(5),
            fail_open_after: 5,
        }
    }
}

/// Outcome of a slot acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDecision {
    /// Global count after the operation, or the best estimate of it.
    pub global_count: u32,

    /// Whether the slot was granted.
    pub accepted: bool,
}

/// Lock-free observability snapshot.
#[derive(Debug, Clone)]
pub struct AdmissionStats {
    /// Slots currently held across the fleet.
    pub global_count: u32,

    /// The configured ceiling.
    pub max_sessions: u32,

    /// Slot count per worker.
    pub per_worker: HashMap<String, u32>,

    /// Registered resources across the fleet.
    pub resource_count: usize,
}

/// Cross-process admission control over a shared ledger directory.
///
/// All coordination is filesystem-mediated: the ledger document is the
/// only state shared between processes, and it is touched exclusively
/// while the ledger lock is held. Throughput is bounded by that single
/// lock; correctness rests on one invariant: no two processes hold it
/// simultaneously.
///
/// No operation here is fatal to the caller. When the lock cannot be
/// obtained within the retry policy, mutations fall back to a lock-free
/// estimated count without persisting, so a coordination outage degrades
/// capacity enforcement instead of halting the fleet.
pub struct AdmissionController {
    identity: WorkerIdentity,
    store: LedgerStore,
    lock: FileLock,
    config: AdmissionConfig,
}

impl AdmissionController {
    /// Create a controller over `dir` for this worker.
    pub fn new(dir: impl AsRef<Path>, identity: WorkerIdentity, config: AdmissionConfig) -> Self {
        let dir = dir.as_ref();
        let lock = FileLock::with_config(dir, LEDGER_LOCK_NAME, identity.id(), config.lock.clone());
        Self {
            identity,
            store: LedgerStore::new(dir),
            lock,
            config,
        }
    }

    /// This worker's identity.
    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// A reaper sharing this controller's ledger directory and identity.
    pub fn reaper(&self, config: ReaperConfig) -> Reaper {
        Reaper::from_parts(
            self.identity.clone(),
            self.store.clone(),
            self.lock.clone(),
            config,
        )
    }

    /// Try to take one slot from the global budget.
    ///
    /// Under the lock: rejects without mutating when the budget is
    /// exhausted, otherwise persists the incremented global counter plus
    /// this worker's own counter and activity stamp.
    pub async fn try_acquire_slot(&self) -> SlotDecision {
        match self.acquire_slot_locked().await {
            Ok(decision) => decision,
            Err(e) => {
                let estimate = self.estimate().await;
                let accepted = estimate < self.config.max_sessions;
                warn!(
                    worker = %self.identity,
                    error = %e,
                    estimate,
                    accepted,
                    "slot acquisition degraded to lock-free estimate"
                );
                SlotDecision {
                    global_count: if accepted { estimate + 1 } else { estimate },
                    accepted,
                }
            }
        }
    }

    async fn acquire_slot_locked(&self) -> Result<SlotDecision, CorralError> {
        let guard = self.lock_for_mutation().await?;
        let mut ledger = self.store.load().await?;

        let new_count = ledger.global_count.saturating_add(1);
        let decision = if new_count > self.config.max_sessions {
            SlotDecision {
                global_count: ledger.global_count,
                accepted: false,
            }
        } else {
            ledger.global_count = new_count;
            let entry = ledger.touch(self.identity.id());
            entry.count = entry.count.saturating_add(1);
            self.store.save(&mut ledger).await?;
            SlotDecision {
                global_count: new_count,
                accepted: true,
            }
        };

        guard.release().await;
        debug!(
            worker = %self.identity,
            global = decision.global_count,
            accepted = decision.accepted,
            "slot acquisition"
        );
        Ok(decision)
    }

    /// Return one slot to the global budget.
    ///
    /// Both the global and the per-worker counter floor at zero, so
    /// mismatched or duplicate releases never drive the ledger negative.
    /// Always succeeds; a lock outage degrades to a lock-free estimate.
    pub async fn release_slot(&self) -> u32 {
        match self.release_slot_locked().await {
            Ok(count) => count,
            Err(e) => {
                let estimate = self.estimate().await;
                warn!(
                    worker = %self.identity,
                    error = %e,
                    estimate,
                    "slot release degraded to lock-free estimate"
                );
                estimate.saturating_sub(1)
            }
        }
    }

    async fn release_slot_locked(&self) -> Result<u32, CorralError> {
        let guard = self.lock_for_mutation().await?;
        let mut ledger = self.store.load().await?;

        ledger.global_count = ledger.global_count.saturating_sub(1);
        let entry = ledger.touch(self.identity.id());
        entry.count = entry.count.saturating_sub(1);
        let count = ledger.global_count;
        self.store.save(&mut ledger).await?;

        guard.release().await;
        debug!(worker = %self.identity, global = count, "slot released");
        Ok(count)
    }

    /// Wait until the global budget has room, up to `max_wait`.
    ///
    /// Polls a lock-free availability check with a delay that grows with
    /// every unavailable poll. Internal errors (unreadable or malformed
    /// ledger) past [`AdmissionConfig::fail_open_after`] report
    /// availability instead of blocking: liveness over safety, so a
    /// broken ledger cannot deadlock the whole fleet. Returns `false`
    /// only when `max_wait` elapses without a slot opening up.
    pub async fn wait_for_slot(&self, max_wait: Duration) -> bool {
        let started = Instant::now();
        let mut unavailable: u32 = 0;
        let mut errors: u32 = 0;

        loop {
            match self.store.load().await {
                Ok(ledger) => {
                    if ledger.global_count < self.config.max_sessions {
                        return true;
                    }
                    unavailable += 1;
                }
                Err(e) => {
                    errors += 1;
                    warn!(worker = %self.identity, error = %e, errors, "availability check failed");
                    if errors > self.config.fail_open_after {
                        warn!(
                            worker = %self.identity,
                            "failing open after repeated ledger read failures"
                        );
                        return true;
                    }
                }
            }

            let delay = (self.config.poll_base + self.config.poll_step * unavailable)
                .min(self.config.poll_cap);
            if started.elapsed() + delay > max_wait {
                return false;
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Register a named resource owned by this worker.
    ///
    /// Best-effort: a short lock timeout and swallowed failures. Losing
    /// this metadata only blunts the reaper's sweep, never the counters.
    pub async fn register_resource(&self, resource_id: &str) {
        if let Err(e) = self.register_locked(resource_id).await {
            warn!(
                worker = %self.identity,
                resource = resource_id,
                error = %e,
                "resource registration skipped"
            );
        }
    }

    async fn register_locked(&self, resource_id: &str) -> Result<(), CorralError> {
        let guard = self.lock.acquire(self.config.registration_timeout).await?;
        let mut ledger = self.store.load().await?;
        ledger.resources.insert(
            resource_id.to_string(),
            ResourceEntry {
                owner_worker_id: self.identity.id().to_string(),
                created_at: Utc::now(),
            },
        );
        self.store.save(&mut ledger).await?;
        guard.release().await;
        Ok(())
    }

    /// Remove a previously registered resource. Best-effort, like
    /// registration.
    pub async fn unregister_resource(&self, resource_id: &str) {
        if let Err(e) = self.unregister_locked(resource_id).await {
            warn!(
                worker = %self.identity,
                resource = resource_id,
                error = %e,
                "resource unregistration skipped"
            );
        }
    }

    async fn unregister_locked(&self, resource_id: &str) -> Result<(), CorralError> {
        let guard = self.lock.acquire(self.config.registration_timeout).await?;
        let mut ledger = self.store.load().await?;
        ledger.resources.remove(resource_id);
        self.store.save(&mut ledger).await?;
        guard.release().await;
        Ok(())
    }

    /// Observability snapshot, read without the lock.
    ///
    /// Tolerates stale reads; atomic saves keep the document whole even
    /// when a writer renames it underneath us.
    pub async fn stats(&self) -> Result<AdmissionStats, CorralError> {
        let ledger = self.store.load().await?;
        Ok(AdmissionStats {
            global_count: ledger.global_count,
            max_sessions: self.config.max_sessions,
            per_worker: ledger
                .per_worker
                .iter()
                .map(|(id, entry)| (id.clone(), entry.count))
                .collect(),
            resource_count: ledger.resources.len(),
        })
    }

    /// Graceful shutdown: hand back everything this worker holds.
    ///
    /// Subtracts this worker's recorded count from the global counter,
    /// removes its ledger entry, and unregisters its resources.
    pub async fn drain(&self) -> Result<(), CorralError> {
        let guard = self.lock_for_mutation().await?;
        let mut ledger = self.store.load().await?;

        if let Some(entry) = ledger.per_worker.remove(self.identity.id()) {
            ledger.global_count = ledger.global_count.saturating_sub(entry.count);
        }
        ledger
            .resources
            .retain(|_, r| r.owner_worker_id != self.identity.id());
        self.store.save(&mut ledger).await?;

        guard.release().await;
        info!(worker = %self.identity, "worker drained");
        Ok(())
    }

    /// Acquire the ledger lock under the counter-mutation retry policy:
    /// bounded attempts, each waiting longer than the last.
    async fn lock_for_mutation(&self) -> Result<LockGuard, LockError> {
        let mut last: Option<LockError> = None;
        for attempt in 0..self.config.mutation_retries.max(1) {
            let timeout = self.config.mutation_timeout * (attempt + 1);
            match self.lock.acquire(timeout).await {
                Ok(guard) => return Ok(guard),
                Err(e @ LockError::Timeout { .. }) => {
                    warn!(
                        worker = %self.identity,
                        attempt,
                        "ledger lock busy; retrying with a longer timeout"
                    );
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(LockError::Timeout {
            name: LEDGER_LOCK_NAME.to_string(),
            attempts: 0,
            waited_ms: 0,
        }))
    }

    /// Best-effort lock-free read of the global count.
    async fn estimate(&self) -> u32 {
        self.store
            .load()
            .await
            .map(|ledger| ledger.global_count)
            .unwrap_or(0)
    }
}
