// ABOUTME: Defines all error types for the corral library using thiserror.
// ABOUTME: Each submodule has its own error enum, unified under CorralError.

/// Top-level error type for the corral library.
#[derive(Debug, thiserror::Error)]
pub enum CorralError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors from cross-process lock operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out acquiring lock '{name}' after {attempts} attempts ({waited_ms}ms)")]
    Timeout {
        name: String,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from ledger persistence.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ledger document: {0}")]
    Malformed(#[from] serde_json::Error),
}
