use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::sync::{mpsc, Semaphore};

use crate::{
    backoff::Strategy,
    handler::JobHandler,
    job::ErrorKind,
    registry::{JobRegistry, RunOutcome},
    runner::{self, RunContext},
    Message,
};

/// Slack within which a job counts as imminent enough to dispatch rather
/// than sleep again.
const DELTA: Duration = Duration::from_millis(15);

/// The tick loop.
///
/// Sleeps until the earliest due job (capped at the poll interval), wakes
/// early on submissions and settlements, and dispatches each due job onto a
/// bounded worker slot. Dispatch only spawns the run and returns; the loop
/// never awaits job completion, so a stuck handler cannot stall dispatch of
/// other jobs beyond occupying its one slot.
pub(crate) struct Driver {
    pub registry: Arc<JobRegistry>,
    pub handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    pub workers: Arc<Semaphore>,
    pub wake: mpsc::UnboundedSender<Message>,
    pub control: mpsc::UnboundedReceiver<Message>,
    pub poll_interval: Duration,
    pub default_timeout: Option<Duration>,
    pub retry_backoff: Arc<dyn Strategy + Send + Sync>,
}

impl Driver {
    pub(crate) async fn run(mut self) {
        loop {
            let delay = self.delay_until_due();
            if delay <= DELTA && !self.dispatch_due().await {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                message = self.control.recv() => match message {
                    Some(Message::Wake) => {}
                    Some(Message::Terminate) | None => break,
                }
            }
        }
        tracing::debug!("shutting down scheduler driver");
    }

    fn delay_until_due(&self) -> Duration {
        match self.registry.next_due_at() {
            Ok(Some(at)) => at
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            Ok(None) => self.poll_interval,
            Err(err) => {
                tracing::error!(?err, "failed to read next due time: {err}");
                self.poll_interval
            }
        }
    }

    /// Dispatches every currently-due job onto a worker slot.
    ///
    /// Returns `false` when a terminate message arrived while waiting for a
    /// free slot.
    async fn dispatch_due(&mut self) -> bool {
        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_closed) => return false,
                },
                message = self.control.recv() => match message {
                    Some(Message::Wake) => continue,
                    Some(Message::Terminate) | None => return false,
                },
            };
            match self.registry.take_due(Utc::now()) {
                Ok(Some(job)) => {
                    let Some(handler) = self.handlers.get(job.handler.as_str()) else {
                        // Submissions are validated against the same map, so
                        // this cannot happen; settle rather than leave the
                        // job running forever.
                        tracing::error!(job_id = %job.id, "no handler registered for `{}`", job.handler);
                        let outcome = RunOutcome::Failed {
                            kind: ErrorKind::Handler("unregistered".to_owned()),
                            details: format!("no handler registered with name `{}`", job.handler),
                        };
                        let _ = self.registry.settle(job.id, outcome, TimeDelta::zero());
                        continue;
                    };
                    let ctx = RunContext {
                        registry: Arc::clone(&self.registry),
                        handler: Arc::clone(handler),
                        wake: self.wake.clone(),
                        default_timeout: self.default_timeout,
                        retry_backoff: Arc::clone(&self.retry_backoff),
                    };
                    tokio::spawn(runner::run_job(ctx, job, permit));
                }
                Ok(None) => return true,
                Err(err) => {
                    tracing::error!(?err, "failed to pop due jobs: {err}");
                    return true;
                }
            }
        }
    }
}
