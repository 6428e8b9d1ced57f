//! An in-process background job scheduler.
//!
//! Jobs are units of deferred or recurring work: a registered handler, a
//! trigger (one-shot timestamp, fixed interval, or cron expression), and an
//! opaque JSON payload. A tick loop dispatches each job at its due time onto
//! a bounded worker pool, off the caller's path; callers keep only
//! [`job::JobId`]s for status lookup and cancellation.
//!
//! The scheduler is an explicitly constructed, explicitly owned handle;
//! there is no process-wide singleton. Build one with [`Scheduler::builder`],
//! share it, and tear it down with [`Scheduler::graceful_shutdown`].
//!
//! # Example
//!
//! ```no_run
//! use chrono::TimeDelta;
//! use metronome::prelude::*;
//! use serde_json::json;
//!
//! struct Transcode;
//!
//! #[async_trait::async_trait]
//! impl JobHandler for Transcode {
//!     async fn run(&self, ctx: JobContext) -> ExecutionResult {
//!         println!("transcoding {}", ctx.payload);
//!         ExecutionResult::Done
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SchedulerError> {
//!     let scheduler = Scheduler::builder()
//!         .with_handler("transcode", Transcode)
//!         .spawn()?;
//!
//!     let job_id = JobBuilder::new("transcode")
//!         .with_payload(json!({"course": 7}))?
//!         .schedule_in(TimeDelta::seconds(30))
//!         .submit(&scheduler)?;
//!     println!("submitted {job_id}");
//!
//!     scheduler.graceful_shutdown().await
//! }
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::TimeDelta;
use futures::Stream;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};

pub mod backoff;
mod driver;
pub mod events;
pub mod handler;
pub mod job;
pub mod prelude;
pub mod pruner;
mod queue;
mod registry;
mod runner;
pub mod snapshot;
pub mod trigger;

use backoff::{BackoffStrategy, Exponential, Jitter, Strategy};
use driver::Driver;
use events::JobEvent;
use handler::JobHandler;
use job::{Job, JobId, JobState};
use pruner::{runner::PruneRunner, PrunerConfig};
use registry::{JobRegistry, NewJob};
use snapshot::{CatchUpPolicy, JobSnapshot};
use trigger::{Trigger, TriggerError};

/// The default backoff between retries of a failed job: exponential from
/// 4 seconds, capped at 15 minutes, with a 10% jitter margin.
const DEFAULT_RETRY_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(4))
        .with_max(TimeDelta::minutes(15))
        .with_jitter(Jitter::Relative(0.1));

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),
    #[error("no job found with id {0}")]
    NotFound(JobId),
    #[error("no handler registered with name `{0}`")]
    UnknownHandler(String),
    #[error("scheduler state is poisoned")]
    BadState,
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub(crate) enum Message {
    Wake,
    Terminate,
}

/// Tuning knobs for a scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Size of the worker pool: the number of jobs that may run at once.
    pub max_workers: usize,
    /// Upper bound on how long the tick loop sleeps without being woken.
    pub poll_interval: Duration,
    /// Run budget applied to jobs that set none themselves; `None` leaves
    /// runs unbounded unless a handler or job says otherwise.
    pub default_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            poll_interval: Duration::from_secs(30),
            default_timeout: None,
        }
    }
}

/// Assembles and spawns a [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    pruner: Option<PrunerConfig>,
    restore: Option<(Vec<JobSnapshot>, CatchUpPolicy)>,
    retry_backoff: Arc<dyn Strategy + Send + Sync>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            config: SchedulerConfig::default(),
            handlers: HashMap::new(),
            pruner: None,
            restore: None,
            retry_backoff: Arc::new(DEFAULT_RETRY_BACKOFF),
        }
    }
}

impl SchedulerBuilder {
    /// Registers a handler under a tag. Submissions reference the tag.
    pub fn with_handler(mut self, name: &'static str, handler: impl JobHandler + 'static) -> Self {
        self.handlers.insert(name, Arc::new(handler));
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// Replaces the default retry backoff for failed jobs with attempts
    /// remaining.
    pub fn with_retry_backoff(mut self, strategy: impl Strategy + Send + Sync + 'static) -> Self {
        self.retry_backoff = Arc::new(strategy);
        self
    }

    pub fn with_job_pruner(mut self, config: PrunerConfig) -> Self {
        self.pruner = Some(config);
        self
    }

    /// Reloads jobs exported by [`Scheduler::snapshot`] before the first
    /// tick. See [`crate::snapshot`] for the catch-up semantics.
    pub fn restore(mut self, snapshots: Vec<JobSnapshot>, policy: CatchUpPolicy) -> Self {
        self.restore = Some((snapshots, policy));
        self
    }

    /// Spawns the scheduler's driver (and pruner, when configured) onto the
    /// current tokio runtime.
    pub fn spawn(self) -> Result<Scheduler, SchedulerError> {
        let registry = Arc::new(JobRegistry::new());
        if let Some((snapshots, policy)) = self.restore {
            let restored = registry.restore(snapshots, policy)?;
            if restored > 0 {
                tracing::info!(restored, "restored {restored} jobs from snapshot");
            }
        }

        let handlers = Arc::new(self.handlers);
        let (sender, control) = mpsc::unbounded_channel();
        let driver = Driver {
            registry: Arc::clone(&registry),
            handlers: Arc::clone(&handlers),
            workers: Arc::new(Semaphore::new(self.config.max_workers.max(1))),
            wake: sender.clone(),
            control,
            poll_interval: self.config.poll_interval,
            default_timeout: self.config.default_timeout,
            retry_backoff: self.retry_backoff,
        };
        let handle = tokio::spawn(driver.run());
        let pruner = self.pruner.map(|config| {
            PruneRunner {
                registry: Arc::clone(&registry),
                config,
            }
            .spawn()
        });

        Ok(Scheduler {
            registry,
            handlers,
            driver: TaskHandle {
                sender,
                handle: Some(handle),
            },
            pruner,
        })
    }
}

/// Handle to a running scheduler.
///
/// Submission, cancellation, and status lookup are all available from any
/// thread holding (a reference to) the handle; the dispatch work itself
/// happens on the spawned driver task.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    driver: TaskHandle,
    pruner: Option<TaskHandle>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Registers a job for the named handler.
    ///
    /// Fails synchronously with [`SchedulerError::InvalidTrigger`] for
    /// malformed or past triggers and [`SchedulerError::UnknownHandler`] for
    /// unregistered tags. On success the job is `Pending` and queued in
    /// due-time order. For per-job options use
    /// [`job::builder::JobBuilder`].
    pub fn submit(
        &self,
        handler: &str,
        trigger: Trigger,
        payload: serde_json::Value,
    ) -> Result<JobId, SchedulerError> {
        self.enqueue(NewJob {
            handler: handler.to_owned(),
            payload,
            trigger,
            overlap: Default::default(),
            max_attempts: 1,
            timeout: None,
        })
    }

    pub(crate) fn enqueue(&self, new_job: NewJob) -> Result<JobId, SchedulerError> {
        if !self.handlers.contains_key(new_job.handler.as_str()) {
            return Err(SchedulerError::UnknownHandler(new_job.handler));
        }
        let id = self.registry.insert(new_job)?;
        let _ = self.driver.sender.send(Message::Wake);
        Ok(id)
    }

    /// Cancels a job, returning `true` only when a `Pending` job was removed
    /// from scheduling.
    ///
    /// Unknown and already-terminal jobs return `false`. So does a `Running`
    /// job: its cancellation token is fired and no further occurrence will be
    /// scheduled, but the in-flight run is only stopped if its handler
    /// cooperates.
    pub fn cancel(&self, id: JobId) -> bool {
        self.registry
            .cancel(id)
            .inspect_err(|err| tracing::error!(?err, %id, "failed to cancel job {id}: {err}"))
            .unwrap_or(false)
    }

    /// The job's current state; [`SchedulerError::NotFound`] for unknown ids.
    pub fn status(&self, id: JobId) -> Result<JobState, SchedulerError> {
        self.registry.state(id)
    }

    /// The full job record, including recorded errors and timestamps.
    pub fn lookup(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.registry.job(id)
    }

    /// Exports every non-terminal job for external persistence.
    pub fn snapshot(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        self.registry.snapshot()
    }

    /// A stream of job state transitions, starting from the moment of
    /// subscription.
    pub fn subscribe(&self) -> Result<impl Stream<Item = JobEvent>, SchedulerError> {
        let mut receiver = self.registry.events().subscribe()?;
        Ok(async_stream::stream! {
            while let Some(event) = receiver.recv().await {
                yield event;
            }
        })
    }

    /// Stops the driver and pruner loops.
    ///
    /// Runs that are already in flight are independent tasks and settle on
    /// their own.
    pub async fn graceful_shutdown(mut self) -> Result<(), SchedulerError> {
        tracing::debug!("shutting down scheduler tasks");
        let mut handles = vec![&mut self.driver];
        if let Some(pruner) = self.pruner.as_mut() {
            handles.push(pruner);
        }
        futures::future::join_all(handles.into_iter().map(TaskHandle::graceful_shutdown))
            .await
            .into_iter()
            .collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }
}

pub(crate) struct TaskHandle {
    pub(crate) sender: mpsc::UnboundedSender<Message>,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), SchedulerError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| SchedulerError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| SchedulerError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}
