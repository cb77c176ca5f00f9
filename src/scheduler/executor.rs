// ABOUTME: WorkExecutor - the collaborator boundary for one unit of work.
// ABOUTME: The scheduler owns retries and cancellation; the executor owns one attempt.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::outcome::AttemptOutcome;

/// Performs one attempt of one unit of work.
///
/// Implementations drive the actual session (navigation, form filling,
/// whatever the batch is for) and classify what happened into an
/// [`AttemptOutcome`]. The scheduler supplies the shared cancellation
/// token; implementations should check it at their own suspension points
/// and bail out early once it fires. Cancellation is cooperative, never
/// preemptive: a step already in flight may still run to completion.
///
/// `attempt` starts at 1 and increments on every retry of the same
/// input, so an implementation can reload or refresh its session state
/// before retrying.
///
/// Returning `Err` reports an unexpected failure local to this unit; the
/// scheduler isolates it and keeps the rest of the batch running.
#[async_trait]
pub trait WorkExecutor<T>: Send + Sync {
    async fn execute(
        &self,
        input: &T,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, anyhow::Error>;
}
