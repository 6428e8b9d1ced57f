use std::sync::Arc;
use std::time::Duration;

use tokio::{
    sync::{mpsc, OwnedSemaphorePermit},
    task::JoinError,
};
use tracing::{instrument, Instrument};

use crate::{
    backoff::Strategy,
    handler::{ExecutionResult, JobContext, JobHandler},
    job::ErrorKind,
    registry::{DispatchedJob, JobRegistry, RunOutcome},
    Message,
};

/// Shared pieces the driver hands to every spawned run.
pub(crate) struct RunContext {
    pub registry: Arc<JobRegistry>,
    pub handler: Arc<dyn JobHandler>,
    pub wake: mpsc::UnboundedSender<Message>,
    pub default_timeout: Option<Duration>,
    pub retry_backoff: Arc<dyn Strategy + Send + Sync>,
}

/// Executes one run of a dispatched job and settles its outcome.
///
/// The handler future runs on its own task so a panic surfaces as a
/// [`JoinError`] here instead of tearing down the dispatch loop. The worker
/// permit is held until the outcome is settled, so a job observed in a
/// terminal state has fully released its slot.
#[instrument(skip_all, fields(job_id = %job.id, handler = %job.handler))]
pub(crate) async fn run_job(ctx: RunContext, job: DispatchedJob, permit: OwnedSemaphorePermit) {
    let timeout = job
        .timeout
        .or_else(|| ctx.handler.timeout())
        .or(ctx.default_timeout);
    let retry_in = ctx.retry_backoff.backoff(job.attempt);
    let job_id = job.id;

    tracing::debug!(%job_id, attempt = job.attempt, "executing job {job_id}");

    let context = JobContext {
        id: job.id,
        payload: job.payload,
        attempt: job.attempt,
        cancellation: job.cancellation,
    };
    let handler = Arc::clone(&ctx.handler);
    let mut handle = tokio::spawn(async move { handler.run(context).await }.in_current_span());

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(result) => outcome_of(result),
            Err(_elapsed) => {
                handle.abort();
                tracing::warn!(%job_id, "job {job_id} exceeded its run budget of {limit:?}");
                RunOutcome::Failed {
                    kind: ErrorKind::Timeout,
                    details: format!("run exceeded its budget of {limit:?}"),
                }
            }
        },
        None => outcome_of(handle.await),
    };

    let _ = ctx
        .registry
        .settle(job_id, outcome, retry_in)
        .inspect_err(|err| {
            tracing::error!(?err, %job_id, "failed to record outcome for job {job_id}: {err}")
        });
    drop(permit);
    let _ = ctx.wake.send(Message::Wake);
}

fn outcome_of(result: Result<ExecutionResult, JoinError>) -> RunOutcome {
    match result {
        Ok(ExecutionResult::Done) => RunOutcome::Done,
        Ok(ExecutionResult::Cancelled { reason }) => RunOutcome::Cancelled { reason },
        Ok(ExecutionResult::Error { error }) => RunOutcome::Failed {
            kind: ErrorKind::Handler(error.error_type().to_owned()),
            details: error.to_string(),
        },
        Err(join_error) => RunOutcome::Failed {
            kind: ErrorKind::Panic,
            details: panic_message(join_error),
        },
    }
}

fn panic_message(error: JoinError) -> String {
    let fallback = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}
