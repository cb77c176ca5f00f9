// ABOUTME: Cross-process mutual exclusion backed by exclusive file creation.
// ABOUTME: Backoff with jitter on conflict, stale-token reclamation, owner-checked release.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::LockError;

/// Tunables for lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// First backoff delay after a conflict.
    pub base_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Upper bound of the uniform jitter added to every backoff.
    pub jitter_max: Duration,

    /// Age beyond which an existing token is presumed abandoned.
    ///
    /// Reclamation trades safety for liveness: a slow but alive holder
    /// can have its token stolen once it looks this old. Tune to
    /// comfortably exceed the longest critical section.
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter_max: Duration::from_millis(100),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// A named cross-process lock backed by exclusive file creation.
///
/// The token file's entire content is the owner identifier; its
/// modification time is the acquisition time. At most one process holds
/// the token at any instant, and only the holder deletes it. Acquisition
/// is advisory: the owner check on release protects against deleting a
/// token that was reclaimed and re-acquired underneath us.
#[derive(Debug, Clone)]
pub struct FileLock {
    name: String,
    path: PathBuf,
    owner: String,
    config: LockConfig,
}

impl FileLock {
    /// Create a lock handle for `name` inside `dir`, owned by `owner`.
    pub fn new(dir: impl AsRef<Path>, name: &str, owner: impl Into<String>) -> Self {
        Self::with_config(dir, name, owner, LockConfig::default())
    }

    /// Create a lock handle with explicit tunables.
    pub fn with_config(
        dir: impl AsRef<Path>,
        name: &str,
        owner: impl Into<String>,
        config: LockConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: dir.as_ref().join(format!("{name}.lock")),
            owner: owner.into(),
            config,
        }
    }

    /// Path of the token file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, waiting up to `timeout`.
    ///
    /// Conflicts back off exponentially with jitter. An existing token
    /// older than [`LockConfig::stale_after`] is deleted and the attempt
    /// retried immediately without sleeping; the race where another
    /// process deletes it first is tolerated.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            match self.try_create().await {
                Ok(()) => {
                    debug!(
                        lock = %self.name,
                        owner = %self.owner,
                        attempt,
                        "lock acquired"
                    );
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        owner: self.owner.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::Io(e)),
            }

            if self.reclaim_if_stale().await? {
                // The token was stale and is gone now; retry at once.
                continue;
            }

            attempt += 1;
            let backoff = self.backoff(attempt);
            if started.elapsed() + backoff > timeout {
                return Err(LockError::Timeout {
                    name: self.name.clone(),
                    attempts: attempt,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// One atomic create-exclusive attempt, writing the owner as content.
    async fn try_create(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;

        if let Err(e) = file.write_all(self.owner.as_bytes()).await {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(e);
        }
        if let Err(e) = file.sync_all().await {
            let _ = tokio::fs::remove_file(&self.path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Delete the existing token if it is older than the stale threshold.
    ///
    /// Returns true when the token was removed, by us or by someone who
    /// beat us to it.
    async fn reclaim_if_stale(&self) -> Result<bool, LockError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            // Holder released between our create attempt and now.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(LockError::Io(e)),
        };

        let age = meta
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);
        if age <= self.config.stale_after {
            return Ok(false);
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                warn!(
                    lock = %self.name,
                    age_secs = age.as_secs(),
                    "reclaimed stale lock token"
                );
                Ok(true)
            }
            // Another process reclaimed it first.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    /// Backoff for the given conflict attempt: capped exponential plus
    /// uniform jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.base_delay.as_secs_f64() * 1.5f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_secs_f64());
        let jitter_ms = if self.config.jitter_max.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.jitter_max.as_millis() as u64)
        };
        Duration::from_secs_f64(capped) + Duration::from_millis(jitter_ms)
    }
}

/// RAII guard for a held lock token.
///
/// Call [`LockGuard::release`] for an explicit, awaited release.
/// Dropping an unreleased guard falls back to a best-effort synchronous
/// removal so a scope that errors out does not leave the token behind.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Release the lock.
    ///
    /// The token is deleted only when its content still matches this
    /// owner; a missing or foreign token is left alone. Errors are
    /// swallowed: release is idempotent and best-effort.
    pub async fn release(mut self) {
        self.released = true;
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content == self.owner => {
                if let Err(e) = tokio::fs::remove_file(&self.path).await
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!(lock = %self.path.display(), error = %e, "failed to remove lock token");
                }
            }
            Ok(content) => {
                warn!(
                    lock = %self.path.display(),
                    holder = %content,
                    "lock token no longer ours; leaving it"
                );
            }
            // Already gone.
            Err(_) => {}
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content == self.owner => {
                if let Err(e) = std::fs::remove_file(&self.path)
                    && e.kind() != ErrorKind::NotFound
                {
                    warn!(lock = %self.path.display(), error = %e, "failed to remove lock token on drop");
                }
            }
            _ => {}
        }
    }
}
