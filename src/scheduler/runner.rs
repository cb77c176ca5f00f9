// ABOUTME: The cancellable batch scheduler - races units, propagates early exit, aggregates reports.
// ABOUTME: Cancellation is cooperative; after a halt the pending set gets a short grace drain.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::WorkExecutor;
use super::outcome::{AttemptOutcome, BatchRun, ControlSignal, HaltReason, TaskReport, TaskState};

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Retries allowed per unit on transient failures; the unit runs at
    /// most this many attempts plus the first one.
    pub max_transient_retries: u32,

    /// Delay between a transient failure and the next attempt.
    pub retry_delay: Duration,

    /// Scale of the per-unit launch stagger: unit `i` waits a uniform
    /// random delay up to `i * stagger_step` before its first attempt,
    /// so launches do not land on the endpoint as one burst.
    pub stagger_step: Duration,

    /// How long to wait for in-flight units after cancellation fires.
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            retry_delay: Duration::from_millis(500),
            stagger_step: Duration::from_millis(250),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

/// What one unit reported when it settled.
struct Settled {
    index: usize,
    state: TaskState,
    attempts: u32,
    detail: Option<String>,
    signal: ControlSignal,
}

/// Runs a batch of independent units concurrently with early-exit
/// cancellation.
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create a scheduler with the given tunables.
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Run one unit per input and aggregate every result.
    ///
    /// Units launch staggered and race to completion. A unit that
    /// settles with a halt signal cancels the shared token; its
    /// still-running siblings observe the token at their next suspension
    /// point. After a short grace period whatever has not settled is
    /// aborted and recorded as such. The returned run always carries one
    /// report per input, in input order, with the halting unit marked as
    /// the trigger.
    pub async fn run_concurrent<T>(
        &self,
        inputs: Vec<T>,
        executor: Arc<dyn WorkExecutor<T>>,
    ) -> BatchRun<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let run_id = Uuid::new_v4();
        let total = inputs.len();
        let mut run = BatchRun {
            run_id,
            tasks: Vec::with_capacity(total),
            cancelled: false,
            triggering: None,
            halt_reason: None,
        };
        if total == 0 {
            return run;
        }

        let token = CancellationToken::new();
        let mut pending = FuturesUnordered::new();
        let mut aborts = Vec::with_capacity(total);

        for (index, input) in inputs.iter().cloned().enumerate() {
            let executor = Arc::clone(&executor);
            let token = token.clone();
            let config = self.config.clone();
            let is_final = index == total - 1;

            let handle = tokio::spawn(async move {
                stagger(index, config.stagger_step, &token).await;
                drive_unit(index, input, is_final, executor, token, &config).await
            });
            aborts.push(handle.abort_handle());
            pending.push(async move {
                match handle.await {
                    Ok(settled) => settled,
                    Err(e) if e.is_cancelled() => Settled {
                        index,
                        state: TaskState::Aborted,
                        attempts: 0,
                        detail: Some("aborted before settling".to_string()),
                        signal: ControlSignal::Continue,
                    },
                    Err(e) => {
                        warn!(unit = index, error = %e, "unit crashed");
                        Settled {
                            index,
                            state: TaskState::Errored,
                            attempts: 0,
                            detail: Some(format!("unit crashed: {e}")),
                            signal: ControlSignal::Continue,
                        }
                    }
                }
            });
        }

        debug!(%run_id, units = total, "batch launched");
        let mut slots: Vec<Option<TaskReport<T>>> = (0..total).map(|_| None).collect();

        // Race phase: settle units until all are done or one halts.
        while let Some(settled) = pending.next().await {
            let halted = match settled.signal {
                ControlSignal::Halt(reason) => {
                    run.cancelled = true;
                    run.triggering = Some(settled.index);
                    run.halt_reason = Some(reason);
                    info!(
                        %run_id,
                        trigger = settled.index,
                        reason = ?reason,
                        "batch halted; cancelling siblings"
                    );
                    true
                }
                ControlSignal::Continue => false,
            };
            store(&mut slots, &inputs, settled);
            if halted {
                token.cancel();
                break;
            }
        }

        // Grace drain: take whatever settles quickly, then abort the rest.
        if run.cancelled {
            let deadline = tokio::time::Instant::now() + self.config.cancel_grace;
            loop {
                match tokio::time::timeout_at(deadline, pending.next()).await {
                    Ok(Some(settled)) => store(&mut slots, &inputs, settled),
                    Ok(None) => break,
                    Err(_) => {
                        for abort in &aborts {
                            abort.abort();
                        }
                        break;
                    }
                }
            }
        }

        // Every input gets a report, even when its unit never settled.
        run.tasks = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| TaskReport {
                    index,
                    input: inputs[index].clone(),
                    state: TaskState::Aborted,
                    attempts: 0,
                    detail: Some("cancelled before completion".to_string()),
                })
            })
            .collect();

        info!(
            %run_id,
            cancelled = run.cancelled,
            completed = run.count_in(TaskState::Completed),
            errored = run.count_in(TaskState::Errored),
            aborted = run.count_in(TaskState::Aborted),
            "batch finished"
        );
        run
    }
}

/// Index-scaled random launch delay, cut short by cancellation.
async fn stagger(index: usize, step: Duration, token: &CancellationToken) {
    if index == 0 || step.is_zero() {
        return;
    }
    let max_ms = step.as_millis() as u64 * index as u64;
    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
    tokio::select! {
        () = token.cancelled() => {}
        () = tokio::time::sleep(delay) => {}
    }
}

/// One unit's bounded retry loop.
///
/// Transient failures retry up to the configured limit with a
/// cancellable delay between attempts. A transient failure on the
/// batch's final input halts the batch instead of retrying.
async fn drive_unit<T>(
    index: usize,
    input: T,
    is_final: bool,
    executor: Arc<dyn WorkExecutor<T>>,
    token: CancellationToken,
    config: &SchedulerConfig,
) -> Settled
where
    T: Send + Sync,
{
    if token.is_cancelled() {
        return Settled {
            index,
            state: TaskState::Aborted,
            attempts: 0,
            detail: Some("cancelled before start".to_string()),
            signal: ControlSignal::Continue,
        };
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let outcome = match executor.execute(&input, attempt, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return Settled {
                    index,
                    state: TaskState::Errored,
                    attempts: attempt,
                    detail: Some(e.to_string()),
                    signal: ControlSignal::Continue,
                };
            }
        };

        match outcome {
            AttemptOutcome::Success => {
                return Settled {
                    index,
                    state: TaskState::Completed,
                    attempts: attempt,
                    detail: None,
                    signal: ControlSignal::Continue,
                };
            }
            AttemptOutcome::CriticalExit => {
                return Settled {
                    index,
                    state: TaskState::Errored,
                    attempts: attempt,
                    detail: Some("critical exit".to_string()),
                    signal: ControlSignal::Halt(HaltReason::CriticalOutcome),
                };
            }
            AttemptOutcome::Fatal(reason) => {
                return Settled {
                    index,
                    state: TaskState::Errored,
                    attempts: attempt,
                    detail: Some(reason),
                    signal: ControlSignal::Continue,
                };
            }
            AttemptOutcome::NeedsRetry if is_final => {
                // Positional: only the final input escalates a transient
                // failure into a batch-wide halt.
                return Settled {
                    index,
                    state: TaskState::Errored,
                    attempts: attempt,
                    detail: Some("transient failure on final input".to_string()),
                    signal: ControlSignal::Halt(HaltReason::TransientOnFinalInput),
                };
            }
            AttemptOutcome::NeedsRetry => {
                if attempt > config.max_transient_retries {
                    return Settled {
                        index,
                        state: TaskState::Errored,
                        attempts: attempt,
                        detail: Some(format!("transient failure persisted after {attempt} attempts")),
                        signal: ControlSignal::Continue,
                    };
                }
                tokio::select! {
                    () = token.cancelled() => {
                        return Settled {
                            index,
                            state: TaskState::Aborted,
                            attempts: attempt,
                            detail: Some("cancelled during retry backoff".to_string()),
                            signal: ControlSignal::Continue,
                        };
                    }
                    () = tokio::time::sleep(config.retry_delay) => {}
                }
            }
        }
    }
}

/// File a settled unit's report into its input-order slot.
fn store<T: Clone>(slots: &mut [Option<TaskReport<T>>], inputs: &[T], settled: Settled) {
    let index = settled.index;
    if index >= slots.len() {
        return;
    }
    slots[index] = Some(TaskReport {
        index,
        input: inputs[index].clone(),
        state: settled.state,
        attempts: settled.attempts,
        detail: settled.detail,
    });
}
