// ABOUTME: Outcome and control-flow types for the batch scheduler.
// ABOUTME: Closed enums replace sentinel strings and ad hoc exit flags.

use uuid::Uuid;

/// Classified result of one executor attempt on one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The unit finished its work.
    Success,

    /// Transient failure; the unit may be retried after a refresh.
    NeedsRetry,

    /// Systemic failure; the whole batch should stop.
    CriticalExit,

    /// Unrecoverable failure local to this unit.
    Fatal(String),
}

/// Scheduler-facing control flow attached to every settled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Keep racing the remaining units.
    Continue,

    /// Cancel the batch.
    Halt(HaltReason),
}

/// Why a settled unit asked the batch to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The executor reported a critical outcome.
    CriticalOutcome,

    /// A transient failure landed on the batch's final input.
    ///
    /// Positional, not content-based: a transient failure anywhere else
    /// in the batch just retries.
    TransientOnFinalInput,
}

/// Lifecycle state of one scheduled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Finished its work.
    Completed,
    /// Observed cancellation before finishing.
    Aborted,
    /// Failed terminally.
    Errored,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Aborted | TaskState::Errored
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Aborted => write!(f, "aborted"),
            TaskState::Errored => write!(f, "errored"),
        }
    }
}

/// Final record for one input of a batch.
#[derive(Debug, Clone)]
pub struct TaskReport<T> {
    /// Position of the input in the submitted batch.
    pub index: usize,

    /// The input itself, returned so results stay tied to input
    /// identity rather than completion order.
    pub input: T,

    /// Terminal state of the unit.
    pub state: TaskState,

    /// Executor attempts performed; zero when the unit never started.
    pub attempts: u32,

    /// Failure or abort detail, when there is one.
    pub detail: Option<String>,
}

/// Aggregated result of one `run_concurrent` call.
///
/// `tasks` is ordered by input position and has one entry per submitted
/// input regardless of how the batch ended; aborted units are recorded,
/// never dropped.
#[derive(Debug, Clone)]
pub struct BatchRun<T> {
    /// Correlation id for this run's log records.
    pub run_id: Uuid,

    /// One report per input, in input order.
    pub tasks: Vec<TaskReport<T>>,

    /// Whether the batch was cancelled before all units settled.
    pub cancelled: bool,

    /// Index of the unit whose outcome triggered cancellation.
    pub triggering: Option<usize>,

    /// Why the batch halted, when it did.
    pub halt_reason: Option<HaltReason>,
}

impl<T> BatchRun<T> {
    /// The report that triggered cancellation, if any.
    pub fn triggering_task(&self) -> Option<&TaskReport<T>> {
        self.triggering.and_then(|i| self.tasks.get(i))
    }

    /// Number of tasks that ended in `state`.
    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }
}
