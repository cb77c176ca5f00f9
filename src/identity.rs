// ABOUTME: Worker identity - stable per-process identifier plus optional fleet ordinal.
// ABOUTME: The coordinator convention lives here: no ordinal (or ordinal 0) coordinates.

use chrono::Utc;

/// Stable identity for one worker process in the fleet.
///
/// The identifier doubles as the lock owner string and as the key for
/// this worker's ledger entry. By default it is derived from the process
/// id and the instant the identity was created (process startup in
/// practice), so two runs of the same binary never collide; callers may
/// inject a fixed identifier instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    id: String,
    ordinal: Option<u32>,
}

impl WorkerIdentity {
    /// Derive an identity from the current process.
    pub fn from_process() -> Self {
        let id = format!(
            "worker-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis()
        );
        Self { id, ordinal: None }
    }

    /// Use an injected identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ordinal: None,
        }
    }

    /// Assign this worker's fleet ordinal.
    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    /// The worker identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The assigned fleet ordinal, if any.
    pub fn ordinal(&self) -> Option<u32> {
        self.ordinal
    }

    /// Whether this worker is the fleet coordinator.
    ///
    /// By convention the worker without an assigned ordinal, or with
    /// ordinal 0, performs the full ledger reset at fleet startup; every
    /// other worker only sweeps incrementally.
    pub fn is_coordinator(&self) -> bool {
        self.ordinal.is_none_or(|o| o == 0)
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}
