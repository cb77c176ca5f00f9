// ABOUTME: Tests for the cross-process file lock.
// ABOUTME: Covers mutual exclusion, stale reclamation, owner-checked release, and timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;

use super::lock::{FileLock, LockConfig};
use crate::error::LockError;

fn quick_config() -> LockConfig {
    LockConfig {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter_max: Duration::from_millis(5),
        stale_after: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_acquire_writes_owner_as_token_content() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::with_config(dir.path(), "session", "worker-a", quick_config());

    let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
    let content = std::fs::read_to_string(lock.path()).unwrap();
    assert_eq!(content, "worker-a");

    guard.release().await;
    assert!(!lock.path().exists());
}

#[tokio::test]
async fn test_second_acquire_times_out_while_held() {
    let dir = TempDir::new().unwrap();
    let lock_a = FileLock::with_config(dir.path(), "session", "worker-a", quick_config());
    let lock_b = FileLock::with_config(dir.path(), "session", "worker-b", quick_config());

    let _guard = lock_a.acquire(Duration::from_secs(1)).await.unwrap();

    let result = lock_b.acquire(Duration::from_millis(100)).await;
    match result.unwrap_err() {
        LockError::Timeout { name, attempts, .. } => {
            assert_eq!(name, "session");
            assert!(attempts >= 1);
        }
        other => panic!("Expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn test_release_is_idempotent_when_token_already_gone() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::with_config(dir.path(), "session", "worker-a", quick_config());

    let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
    std::fs::remove_file(lock.path()).unwrap();

    // Must not panic or error.
    guard.release().await;
}

#[tokio::test]
async fn test_guard_drop_removes_token() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::with_config(dir.path(), "session", "worker-a", quick_config());

    let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(lock.path().exists());

    drop(guard);
    assert!(!lock.path().exists());
}

#[tokio::test]
async fn test_release_leaves_a_foreign_token_alone() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::with_config(dir.path(), "session", "worker-a", quick_config());

    let guard = lock.acquire(Duration::from_secs(1)).await.unwrap();

    // Simulate a reclaim-and-reacquire by another worker while we
    // still believe we hold the token.
    std::fs::write(lock.path(), "worker-b").unwrap();

    guard.release().await;
    let content = std::fs::read_to_string(lock.path()).unwrap();
    assert_eq!(content, "worker-b");
}

#[tokio::test]
async fn test_stale_token_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let mut config = quick_config();
    config.stale_after = Duration::from_millis(50);

    // A crashed holder's leftover token.
    let lock = FileLock::with_config(dir.path(), "session", "worker-b", config);
    std::fs::write(lock.path(), "worker-dead").unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let guard = lock.acquire(Duration::from_secs(2)).await.unwrap();
    let content = std::fs::read_to_string(lock.path()).unwrap();
    assert_eq!(content, "worker-b");
    guard.release().await;
}

#[tokio::test]
async fn test_fresh_token_is_not_reclaimed() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::with_config(dir.path(), "session", "worker-b", quick_config());
    std::fs::write(lock.path(), "worker-a").unwrap();

    let result = lock.acquire(Duration::from_millis(100)).await;
    assert!(matches!(result, Err(LockError::Timeout { .. })));
    assert_eq!(std::fs::read_to_string(lock.path()).unwrap(), "worker-a");
}

#[tokio::test]
async fn test_mutual_exclusion_under_contention() {
    let dir = TempDir::new().unwrap();
    let holders = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..8 {
        let path = dir.path().to_path_buf();
        let holders = Arc::clone(&holders);
        handles.push(tokio::spawn(async move {
            let lock =
                FileLock::with_config(&path, "shared", format!("worker-{}", i), quick_config());
            let guard = lock.acquire(Duration::from_secs(10)).await.unwrap();

            let concurrent = holders.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "two holders held the lock at once");
            tokio::time::sleep(Duration::from_millis(5)).await;
            holders.fetch_sub(1, Ordering::SeqCst);

            guard.release().await;
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}
