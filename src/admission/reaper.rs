// ABOUTME: Cluster reaper - reclaims slots and resources leaked by dead workers.
// ABOUTME: The coordinator resets the ledger at fleet startup; everyone else sweeps incrementally.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use super::LEDGER_LOCK_NAME;
use super::ledger::{Ledger, LedgerStore};
use super::lock::FileLock;
use crate::error::CorralError;
use crate::identity::WorkerIdentity;

/// Tunables for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Workers silent for longer than this are presumed dead.
    pub inactivity_threshold: Duration,

    /// Lock timeout for a sweep.
    pub lock_timeout: Duration,

    /// Upper bound of the randomized startup delay for non-coordinators,
    /// so a fleet booting at once does not pile onto the lock together.
    pub startup_delay_max: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(10),
            startup_delay_max: Duration::from_secs(5),
        }
    }
}

/// Periodic or one-shot sweep over the shared ledger.
///
/// Liveness is judged purely by ledger activity timestamps; a worker
/// that holds slots but has stopped stamping `last_activity` is
/// indistinguishable from a crashed one and will be reaped. Resource
/// ownership is validated only here, not continuously.
pub struct Reaper {
    identity: WorkerIdentity,
    store: LedgerStore,
    lock: FileLock,
    config: ReaperConfig,
}

impl Reaper {
    /// Create a reaper over `dir` for this worker.
    pub fn new(dir: impl AsRef<Path>, identity: WorkerIdentity, config: ReaperConfig) -> Self {
        let dir = dir.as_ref();
        let lock = FileLock::new(dir, LEDGER_LOCK_NAME, identity.id());
        Self {
            identity,
            store: LedgerStore::new(dir),
            lock,
            config,
        }
    }

    pub(crate) fn from_parts(
        identity: WorkerIdentity,
        store: LedgerStore,
        lock: FileLock,
        config: ReaperConfig,
    ) -> Self {
        Self {
            identity,
            store,
            lock,
            config,
        }
    }

    /// Reclaim slots and resources from workers presumed dead.
    ///
    /// Under the lock: every worker whose `last_activity` is older than
    /// `inactivity_threshold` has its recorded count subtracted from the
    /// global counter (floored at zero), its ledger entry deleted, and
    /// every resource it owns removed. Returns how many workers were
    /// reaped.
    pub async fn reap_dead_workers(
        &self,
        inactivity_threshold: Duration,
    ) -> Result<usize, CorralError> {
        let guard = self.lock.acquire(self.config.lock_timeout).await?;
        let mut ledger = self.store.load().await?;

        let reaped = sweep(&mut ledger, inactivity_threshold);
        if !reaped.is_empty() {
            self.store.save(&mut ledger).await?;
        }
        guard.release().await;

        if !reaped.is_empty() {
            info!(
                worker = %self.identity,
                count = reaped.len(),
                reaped = ?reaped,
                "reaped dead workers"
            );
        }
        Ok(reaped.len())
    }

    /// Fleet-startup pass.
    ///
    /// The coordinator resets the ledger to empty. Every other worker
    /// sleeps a randomized delay and then reaps incrementally with the
    /// configured inactivity threshold.
    pub async fn run_startup(&self) -> Result<(), CorralError> {
        if self.identity.is_coordinator() {
            let guard = self.lock.acquire(self.config.lock_timeout).await?;
            let mut ledger = Ledger::empty();
            self.store.save(&mut ledger).await?;
            guard.release().await;
            info!(worker = %self.identity, "coordinator reset the ledger");
            return Ok(());
        }

        let delay_ms = if self.config.startup_delay_max.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.startup_delay_max.as_millis() as u64)
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let reaped = self
            .reap_dead_workers(self.config.inactivity_threshold)
            .await?;
        debug!(worker = %self.identity, reaped, "startup sweep finished");
        Ok(())
    }
}

/// Remove every worker silent past `threshold`; returns their ids.
fn sweep(ledger: &mut Ledger, threshold: Duration) -> Vec<String> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::seconds(300));

    let dead: Vec<String> = ledger
        .per_worker
        .iter()
        .filter(|(_, entry)| entry.last_activity < cutoff)
        .map(|(id, _)| id.clone())
        .collect();

    for id in &dead {
        if let Some(entry) = ledger.per_worker.remove(id) {
            ledger.global_count = ledger.global_count.saturating_sub(entry.count);
        }
        ledger.resources.retain(|_, r| &r.owner_worker_id != id);
    }
    dead
}
