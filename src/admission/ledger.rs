// ABOUTME: The shared ledger document - global and per-worker slot counts plus registered resources.
// ABOUTME: LedgerStore persists it as JSON with atomic temp-then-rename writes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Per-worker slot accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEntry {
    /// Slots currently attributed to this worker.
    pub count: u32,

    /// Last time this worker touched the ledger.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
}

/// A named resource registered by a worker, e.g. one live browser
/// profile directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    /// Worker that registered the resource.
    pub owner_worker_id: String,

    /// When the resource was registered.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// The shared slot-accounting document.
///
/// Exclusively owned by whichever process holds the ledger lock during a
/// read-modify-write; between operations it is shared state on disk.
/// `global_count` equals the sum of per-worker counts after a reaper
/// pass; in between the two may drift (slots leaked by dead workers)
/// until reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    /// Slots currently held across the whole fleet.
    pub global_count: u32,

    /// Accounting entry per live worker.
    #[serde(default)]
    pub per_worker: HashMap<String, WorkerEntry>,

    /// Named resources registered by workers.
    #[serde(default)]
    pub resources: HashMap<String, ResourceEntry>,

    /// When the document was last persisted.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl Ledger {
    /// A ledger with no slots, no workers, no resources.
    pub fn empty() -> Self {
        Self {
            global_count: 0,
            per_worker: HashMap::new(),
            resources: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Sum of all per-worker counts.
    pub fn worker_total(&self) -> u32 {
        self.per_worker.values().map(|w| w.count).sum()
    }

    /// Stamp activity for `worker_id`, creating the entry if absent.
    pub(crate) fn touch(&mut self, worker_id: &str) -> &mut WorkerEntry {
        let entry = self
            .per_worker
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerEntry {
                count: 0,
                last_activity: Utc::now(),
            });
        entry.last_activity = Utc::now();
        entry
    }
}

/// Persistence for the [`Ledger`] document.
///
/// Saves go through a temp file renamed over the target, so lock-free
/// readers never observe a torn document.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    /// Store backed by `ledger.json` inside `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("ledger.json"),
        }
    }

    /// Path of the ledger document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the ledger; an absent file reads as an empty ledger.
    pub async fn load(&self) -> Result<Ledger, LedgerError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Ledger::empty()),
            Err(e) => Err(LedgerError::Io(e)),
        }
    }

    /// Persist the ledger, stamping `last_updated`.
    pub async fn save(&self, ledger: &mut Ledger) -> Result<(), LedgerError> {
        ledger.last_updated = Utc::now();
        let bytes = serde_json::to_vec_pretty(ledger)?;

        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
