use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trigger::Trigger;

pub mod builder;

/// Opaque identifier of a submitted job.
///
/// Assigned by the scheduler at submission. Callers hold ids as weak
/// references for status lookup and cancellation; the scheduler owns the job
/// records themselves.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct JobId(pub(crate) u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Succeeded`, `Failed`, and `Cancelled` are terminal: once reached the job
/// never transitions again. A recurring job re-enters `Pending` after each
/// successful run until it is cancelled.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// What to do when a recurring job's next fire time has already passed by the
/// time the previous run settles.
///
/// Runs of a single job never overlap: the next occurrence is only scheduled
/// once the previous run has settled. The policy decides whether occurrences
/// missed during a long run are made up or dropped.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Skip occurrences that fell due while the previous run executed; the
    /// next fire is the first one in the future.
    #[default]
    Skip,
    /// Never skip an occurrence: if the previous run overran, the next one is
    /// dispatched as soon as a worker slot is free.
    Queue,
}

/// Read-only view of a job held in the scheduler's registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub state: JobState,
    /// Tag of the registered handler this job runs on.
    pub handler: String,
    pub payload: serde_json::Value,
    pub trigger: Trigger,
    pub overlap: OverlapPolicy,
    /// Attempt number of the current or most recent run, 1-based once the
    /// job has been dispatched.
    pub attempt: u16,
    pub max_attempts: u16,
    /// Per-job run budget, overriding the handler's and the scheduler's
    /// defaults.
    pub timeout: Option<Duration>,
    pub errors: Vec<JobError>,
    /// Number of settled runs, including failed ones.
    pub runs: u32,
    pub submitted_at: DateTime<Utc>,
    /// Next fire time while `Pending`; the fire time of the current or last
    /// run otherwise.
    pub due_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when a cancellation request arrived while the job was running.
    /// Cancellation of a running job is cooperative: the in-flight run may
    /// still complete and report its natural terminal state.
    pub cancel_requested: bool,
}

/// An execution fault recorded on a job.
///
/// Faults never propagate into the scheduler's dispatch loop; they are
/// appended here and drive the retry/failure transition.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobError {
    pub attempt: u16,
    pub kind: ErrorKind,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// The handler panicked; the panic message is in the details.
    Panic,
    /// The run exceeded its time budget and was abandoned.
    Timeout,
    /// The job was cancelled, either before execution or by a handler
    /// acknowledging a cancellation request.
    Cancelled,
    /// The handler returned an error; carries the handler's self-reported
    /// error type.
    Handler(String),
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Panic => write!(f, "panic"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Handler(error_type) => write!(f, "{error_type}"),
        }
    }
}
