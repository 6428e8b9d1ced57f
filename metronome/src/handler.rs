use std::{error::Error, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// A unit of work the scheduler knows how to run.
///
/// Handlers are registered on the [`crate::SchedulerBuilder`] under a tag and
/// referenced by that tag at submission. One handler instance serves every
/// job submitted against its tag, so implementations hold only shared state.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes one run of a job.
    ///
    /// Panics are caught and recorded on the job; an uncaught fault here
    /// never reaches the scheduler's dispatch loop.
    async fn run(&self, ctx: JobContext) -> ExecutionResult;

    /// The default run budget for jobs on this handler.
    ///
    /// Overrides the scheduler-wide default; a per-job timeout set via
    /// [`crate::job::builder::JobBuilder::with_timeout`] overrides both.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Everything a handler gets to see about the run it is executing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub payload: serde_json::Value,
    /// 1-based attempt number of this run.
    pub attempt: u16,
    /// Fired when a caller requests cancellation of this running job.
    ///
    /// Cancellation is cooperative: a handler that never looks at this token
    /// simply runs to completion and the job keeps its natural terminal
    /// state. A handler that stops early should return
    /// [`ExecutionResult::Cancelled`] to acknowledge.
    pub cancellation: CancellationToken,
}

impl JobContext {
    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Outcome of a single handler run.
pub enum ExecutionResult {
    Done,
    Cancelled { reason: String },
    Error { error: Box<dyn ExecutionError> },
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

/// An error a handler can fail a run with.
///
/// The `error_type` tags the recorded [`crate::job::JobError`] so callers can
/// distinguish failure classes when inspecting a job's history.
pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}
