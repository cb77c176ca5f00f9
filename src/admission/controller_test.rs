// ABOUTME: Tests for the admission controller's slot accounting and degraded paths.
// ABOUTME: Simulated fleet members are separate controllers sharing one ledger directory.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::controller::{AdmissionConfig, AdmissionController};
use super::ledger::LedgerStore;
use super::lock::LockConfig;
use crate::identity::WorkerIdentity;

fn test_config(max_sessions: u32) -> AdmissionConfig {
    AdmissionConfig {
        max_sessions,
        lock: LockConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_max: Duration::from_millis(5),
            stale_after: Duration::from_secs(60),
        },
        mutation_timeout: Duration::from_millis(500),
        mutation_retries: 2,
        registration_timeout: Duration::from_millis(200),
        poll_base: Duration::from_millis(10),
        poll_step: Duration::from_millis(5),
        poll_cap: Duration::from_millis(50),
        fail_open_after: 2,
    }
}

fn controller(dir: &TempDir, id: &str, max_sessions: u32) -> AdmissionController {
    AdmissionController::new(dir.path(), WorkerIdentity::new(id), test_config(max_sessions))
}

#[tokio::test]
async fn test_accepts_until_budget_exhausted() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 2);

    let first = worker.try_acquire_slot().await;
    assert!(first.accepted);
    assert_eq!(first.global_count, 1);

    let second = worker.try_acquire_slot().await;
    assert!(second.accepted);
    assert_eq!(second.global_count, 2);

    let third = worker.try_acquire_slot().await;
    assert!(!third.accepted);
    assert_eq!(third.global_count, 2);
}

#[tokio::test]
async fn test_rejection_does_not_mutate_the_ledger() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 1);

    assert!(worker.try_acquire_slot().await.accepted);
    assert!(!worker.try_acquire_slot().await.accepted);

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.global_count, 1);
    assert_eq!(stats.per_worker["worker-a"], 1);
}

#[tokio::test]
async fn test_release_floors_at_zero() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 2);

    // Release without ever acquiring, twice.
    assert_eq!(worker.release_slot().await, 0);
    assert_eq!(worker.release_slot().await, 0);

    let stats = worker.stats().await.unwrap();
    assert_eq!(stats.global_count, 0);
}

#[tokio::test]
async fn test_two_workers_share_one_budget() {
    let dir = TempDir::new().unwrap();
    let worker_a = controller(&dir, "worker-a", 3);
    let worker_b = controller(&dir, "worker-b", 3);

    assert!(worker_a.try_acquire_slot().await.accepted);
    assert!(worker_a.try_acquire_slot().await.accepted);
    assert!(worker_b.try_acquire_slot().await.accepted);
    assert!(!worker_b.try_acquire_slot().await.accepted);

    let stats = worker_a.stats().await.unwrap();
    assert_eq!(stats.global_count, 3);
    assert_eq!(stats.per_worker["worker-a"], 2);
    assert_eq!(stats.per_worker["worker-b"], 1);

    assert_eq!(worker_a.release_slot().await, 2);
    assert!(worker_b.try_acquire_slot().await.accepted);
}

#[tokio::test]
async fn test_budget_never_exceeded_under_contention() {
    let dir = TempDir::new().unwrap();
    let worker_a = Arc::new(controller(&dir, "worker-a", 4));
    let worker_b = Arc::new(controller(&dir, "worker-b", 4));

    let mut handles = Vec::new();
    for i in 0..10 {
        let worker = if i % 2 == 0 {
            Arc::clone(&worker_a)
        } else {
            Arc::clone(&worker_b)
        };
        handles.push(tokio::spawn(
            async move { worker.try_acquire_slot().await },
        ));
    }

    let mut accepted = 0;
    for handle in handles {
        let decision = handle.await.unwrap();
        if decision.accepted {
            accepted += 1;
            assert!(decision.global_count <= 4);
        }
    }
    assert_eq!(accepted, 4);

    let stats = worker_a.stats().await.unwrap();
    assert_eq!(stats.global_count, 4);
    assert_eq!(
        stats.per_worker.values().sum::<u32>(),
        stats.global_count,
        "per-worker counts must add up to the global count"
    );
}

#[tokio::test]
async fn test_wait_for_slot_returns_immediately_when_room() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 2);

    assert!(worker.wait_for_slot(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_wait_for_slot_expires_when_budget_full() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 1);
    assert!(worker.try_acquire_slot().await.accepted);

    assert!(!worker.wait_for_slot(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_wait_for_slot_unblocks_on_release() {
    let dir = TempDir::new().unwrap();
    let worker_a = Arc::new(controller(&dir, "worker-a", 1));
    let worker_b = controller(&dir, "worker-b", 1);

    assert!(worker_a.try_acquire_slot().await.accepted);

    let releaser = Arc::clone(&worker_a);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        releaser.release_slot().await;
    });

    assert!(worker_b.wait_for_slot(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_wait_for_slot_fails_open_on_unreadable_ledger() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 1);

    // A ledger that never parses; every poll is an internal error.
    std::fs::write(LedgerStore::new(dir.path()).path(), b"{corrupt").unwrap();

    // Liveness over safety: the wait reports availability instead of
    // blocking for the full five seconds.
    let started = std::time::Instant::now();
    assert!(worker.wait_for_slot(Duration::from_secs(5)).await);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_acquire_degrades_to_estimate_when_lock_unavailable() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(2);
    config.mutation_timeout = Duration::from_millis(50);
    config.mutation_retries = 1;
    let worker = AdmissionController::new(dir.path(), WorkerIdentity::new("worker-a"), config);

    // A fresh foreign token that never goes away within the test.
    std::fs::write(dir.path().join("ledger.lock"), "someone-else").unwrap();

    let decision = worker.try_acquire_slot().await;
    assert!(decision.accepted);
    assert_eq!(decision.global_count, 1);

    // Nothing was persisted: the estimate came from an empty ledger.
    let ledger = LedgerStore::new(dir.path()).load().await.unwrap();
    assert_eq!(ledger.global_count, 0);
    assert!(ledger.per_worker.is_empty());
}

#[tokio::test]
async fn test_register_and_unregister_resources() {
    let dir = TempDir::new().unwrap();
    let worker = controller(&dir, "worker-a", 2);

    worker.register_resource("profile-1").await;
    worker.register_resource("profile-2").await;
    assert_eq!(worker.stats().await.unwrap().resource_count, 2);

    worker.unregister_resource("profile-1").await;
    assert_eq!(worker.stats().await.unwrap().resource_count, 1);
}

#[tokio::test]
async fn test_registration_failure_is_swallowed() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(2);
    config.registration_timeout = Duration::from_millis(30);
    let worker = AdmissionController::new(dir.path(), WorkerIdentity::new("worker-a"), config);

    std::fs::write(dir.path().join("ledger.lock"), "someone-else").unwrap();

    // Must not panic; the metadata is simply lost.
    worker.register_resource("profile-1").await;
    worker.unregister_resource("profile-1").await;
}

#[tokio::test]
async fn test_drain_returns_everything_this_worker_holds() {
    let dir = TempDir::new().unwrap();
    let worker_a = controller(&dir, "worker-a", 5);
    let worker_b = controller(&dir, "worker-b", 5);

    assert!(worker_a.try_acquire_slot().await.accepted);
    assert!(worker_a.try_acquire_slot().await.accepted);
    assert!(worker_b.try_acquire_slot().await.accepted);
    worker_a.register_resource("profile-a").await;
    worker_b.register_resource("profile-b").await;

    worker_a.drain().await.unwrap();

    let stats = worker_b.stats().await.unwrap();
    assert_eq!(stats.global_count, 1);
    assert!(!stats.per_worker.contains_key("worker-a"));
    assert_eq!(stats.per_worker["worker-b"], 1);
    assert_eq!(stats.resource_count, 1);
}
