//! The job registry: the scheduler's single shared mutable structure.
//!
//! All mutations (submission, cancellation, dispatch, settlement, pruning,
//! restore) go through methods here and serialize on one mutex, so concurrent
//! submission and tick-driven dispatch cannot lose updates. Lock poisoning
//! surfaces as [`SchedulerError::BadState`] rather than a panic in the
//! dispatch loop.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    events::{EventBus, JobEvent},
    job::{ErrorKind, Job, JobError, JobId, JobState, OverlapPolicy},
    pruner::{PruneBy, Pruner},
    snapshot::{CatchUpPolicy, JobSnapshot},
    trigger::Trigger,
    SchedulerError,
};

pub(crate) struct JobRegistry {
    inner: Mutex<RegistryInner>,
    events: EventBus,
}

#[derive(Default)]
struct RegistryInner {
    jobs: FxHashMap<JobId, JobRecord>,
    queue: crate::queue::DueQueue,
    next_id: u64,
    next_seq: u64,
}

struct JobRecord {
    job: Job,
    /// Bumped on every (re)schedule and cancellation; due-queue entries with
    /// a stale epoch are discarded when popped.
    epoch: u64,
    /// Token for the current run, replaced at each dispatch.
    cancellation: CancellationToken,
}

/// A job submission, assembled by the scheduler or the job builder.
pub(crate) struct NewJob {
    pub handler: String,
    pub payload: serde_json::Value,
    pub trigger: Trigger,
    pub overlap: OverlapPolicy,
    pub max_attempts: u16,
    pub timeout: Option<Duration>,
}

/// Everything the runner needs to execute one run.
pub(crate) struct DispatchedJob {
    pub id: JobId,
    pub handler: String,
    pub payload: serde_json::Value,
    pub attempt: u16,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
}

/// Outcome of a single run, as reported by the runner.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    Done,
    Cancelled { reason: String },
    Failed { kind: ErrorKind, details: String },
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            events: EventBus::default(),
        }
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers a new job and queues it for dispatch.
    ///
    /// Trigger validation happens here, synchronously: the caller gets an
    /// [`SchedulerError::InvalidTrigger`] before anything is registered.
    pub(crate) fn insert(&self, new_job: NewJob) -> Result<JobId, SchedulerError> {
        let now = Utc::now();
        let due_at = new_job.trigger.first_fire(now)?;

        let mut inner = self.lock()?;
        let id = JobId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let job = Job {
            id,
            state: JobState::Pending,
            handler: new_job.handler,
            payload: new_job.payload,
            trigger: new_job.trigger,
            overlap: new_job.overlap,
            attempt: 0,
            max_attempts: new_job.max_attempts.max(1),
            timeout: new_job.timeout,
            errors: Vec::new(),
            runs: 0,
            submitted_at: now,
            due_at,
            started_at: None,
            finished_at: None,
            cancel_requested: false,
        };
        let event = JobEvent {
            id,
            handler: job.handler.clone(),
            state: JobState::Pending,
            at: now,
        };

        inner.queue.push(crate::queue::DueEntry {
            due_at,
            seq,
            id,
            epoch: 0,
        });
        inner.jobs.insert(
            id,
            JobRecord {
                job,
                epoch: 0,
                cancellation: CancellationToken::new(),
            },
        );
        tracing::debug!(%id, queued = inner.queue.len(), "job {id} scheduled for {due_at}");
        drop(inner);

        self.events.publish(event);
        Ok(id)
    }

    /// Pops the next job due at or before `now` and marks it `Running`.
    ///
    /// Stale queue entries (cancelled or rescheduled jobs) are discarded on
    /// the way. Returns `None` once nothing further is due.
    pub(crate) fn take_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchedJob>, SchedulerError> {
        let mut inner = self.lock()?;
        loop {
            let Some(entry) = inner.queue.peek() else {
                return Ok(None);
            };
            if entry.due_at > now {
                return Ok(None);
            }
            inner.queue.pop();

            let Some(record) = inner.jobs.get_mut(&entry.id) else {
                continue;
            };
            if record.epoch != entry.epoch || record.job.state != JobState::Pending {
                continue;
            }

            record.job.state = JobState::Running;
            record.job.attempt += 1;
            record.job.started_at = Some(now);
            record.cancellation = CancellationToken::new();

            let dispatched = DispatchedJob {
                id: record.job.id,
                handler: record.job.handler.clone(),
                payload: record.job.payload.clone(),
                attempt: record.job.attempt,
                timeout: record.job.timeout,
                cancellation: record.cancellation.clone(),
            };
            let event = JobEvent {
                id: record.job.id,
                handler: record.job.handler.clone(),
                state: JobState::Running,
                at: now,
            };
            drop(inner);

            self.events.publish(event);
            return Ok(Some(dispatched));
        }
    }

    /// The due time of the earliest queued entry, if any.
    ///
    /// May point at a stale entry; the resulting early wake-up is harmless
    /// since [`JobRegistry::take_due`] discards it.
    pub(crate) fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        Ok(self.lock()?.queue.peek().map(|entry| entry.due_at))
    }

    /// Cancels a job. Returns `true` only when a `Pending` job was removed
    /// from scheduling.
    ///
    /// For a `Running` job this records a cancellation request and fires the
    /// run's cancellation token, but returns `false`: cancellation of an
    /// in-flight run is cooperative and the run may still complete. Unknown
    /// and terminal jobs return `false`.
    pub(crate) fn cancel(&self, id: JobId) -> Result<bool, SchedulerError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        match record.job.state {
            JobState::Pending => {
                record.job.state = JobState::Cancelled;
                record.job.finished_at = Some(now);
                record.job.errors.push(JobError {
                    attempt: record.job.attempt,
                    kind: ErrorKind::Cancelled,
                    details: "cancelled before execution".to_owned(),
                    recorded_at: now,
                });
                record.epoch += 1;
                let event = JobEvent {
                    id,
                    handler: record.job.handler.clone(),
                    state: JobState::Cancelled,
                    at: now,
                };
                drop(inner);
                self.events.publish(event);
                Ok(true)
            }
            JobState::Running => {
                record.job.cancel_requested = true;
                record.cancellation.cancel();
                tracing::debug!(%id, "cancellation requested for running job {id}");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn state(&self, id: JobId) -> Result<JobState, SchedulerError> {
        self.lock()?
            .jobs
            .get(&id)
            .map(|record| record.job.state)
            .ok_or(SchedulerError::NotFound(id))
    }

    pub(crate) fn job(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.lock()?
            .jobs
            .get(&id)
            .map(|record| record.job.clone())
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Records a run's outcome and computes the job's next state: terminal,
    /// retried with backoff, or rescheduled for its next occurrence.
    pub(crate) fn settle(
        &self,
        id: JobId,
        outcome: RunOutcome,
        retry_in: TimeDelta,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let mut inner = self.lock()?;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Err(SchedulerError::NotFound(id));
        };
        if record.job.state != JobState::Running {
            tracing::warn!(%id, state = %record.job.state, "settling a job that is not running");
            return Ok(());
        }
        record.job.runs += 1;

        let mut events = Vec::new();
        let mut reschedule = None;
        match outcome {
            RunOutcome::Done => {
                let next = (!record.job.cancel_requested)
                    .then(|| next_occurrence(&record.job, now))
                    .flatten();
                match next {
                    Some(next) => {
                        events.push(event(&record.job, JobState::Succeeded, now));
                        record.job.state = JobState::Pending;
                        record.job.attempt = 0;
                        record.job.started_at = None;
                        record.job.due_at = next;
                        record.epoch += 1;
                        reschedule = Some((next, record.epoch));
                        events.push(event(&record.job, JobState::Pending, now));
                    }
                    None => {
                        record.job.state = JobState::Succeeded;
                        record.job.finished_at = Some(now);
                        events.push(event(&record.job, JobState::Succeeded, now));
                    }
                }
            }
            RunOutcome::Cancelled { reason } => {
                record.job.errors.push(JobError {
                    attempt: record.job.attempt,
                    kind: ErrorKind::Cancelled,
                    details: reason,
                    recorded_at: now,
                });
                record.job.state = JobState::Cancelled;
                record.job.finished_at = Some(now);
                events.push(event(&record.job, JobState::Cancelled, now));
            }
            RunOutcome::Failed { kind, details } => {
                record.job.errors.push(JobError {
                    attempt: record.job.attempt,
                    kind,
                    details,
                    recorded_at: now,
                });
                if record.job.attempt >= record.job.max_attempts || record.job.cancel_requested {
                    record.job.state = JobState::Failed;
                    record.job.finished_at = Some(now);
                    events.push(event(&record.job, JobState::Failed, now));
                } else {
                    let next = now + retry_in;
                    record.job.state = JobState::Pending;
                    record.job.started_at = None;
                    record.job.due_at = next;
                    record.epoch += 1;
                    reschedule = Some((next, record.epoch));
                    events.push(event(&record.job, JobState::Pending, now));
                }
            }
        }

        if let Some((due_at, epoch)) = reschedule {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.queue.push(crate::queue::DueEntry {
                due_at,
                seq,
                id,
                epoch,
            });
        }
        drop(inner);

        for event in events {
            self.events.publish(event);
        }
        Ok(())
    }

    /// Deletes terminal jobs matching the given pruner.
    pub(crate) fn prune(&self, spec: &Pruner) -> Result<usize, SchedulerError> {
        if !spec.state.is_terminal() {
            tracing::warn!(state = %spec.state, "refusing to prune non-terminal jobs");
            return Ok(0);
        }
        let now = Utc::now();
        let mut inner = self.lock()?;
        let doomed: Vec<JobId> = match spec.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = now - age;
                inner
                    .jobs
                    .values()
                    .filter(|record| {
                        spec.matches(&record.job)
                            && record.job.finished_at.is_some_and(|at| at < cutoff)
                    })
                    .map(|record| record.job.id)
                    .collect()
            }
            PruneBy::MaxCount(count) => {
                let mut matching: Vec<(DateTime<Utc>, JobId)> = inner
                    .jobs
                    .values()
                    .filter(|record| spec.matches(&record.job))
                    .map(|record| {
                        let finished = record.job.finished_at.unwrap_or(record.job.submitted_at);
                        (finished, record.job.id)
                    })
                    .collect();
                if matching.len() <= count as usize {
                    return Ok(0);
                }
                matching.sort_by(|a, b| b.cmp(a));
                matching
                    .split_off(count as usize)
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect()
            }
        };
        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len())
    }

    /// Exports every non-terminal job for external persistence.
    pub(crate) fn snapshot(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|record| !record.job.state.is_terminal())
            .map(|record| JobSnapshot::from(&record.job))
            .collect())
    }

    /// Reloads previously snapshotted jobs.
    ///
    /// Idempotent: snapshots whose id is already present are ignored, and the
    /// id counter advances past the highest restored id. Jobs whose fire time
    /// has passed are handled per the catch-up policy; a missed one-shot
    /// under [`CatchUpPolicy::SkipMissed`] is dropped. Returns the number of
    /// jobs restored.
    pub(crate) fn restore(
        &self,
        snapshots: Vec<JobSnapshot>,
        policy: CatchUpPolicy,
    ) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut inner = self.lock()?;
        for snapshot in snapshots {
            if inner.jobs.contains_key(&snapshot.id) {
                continue;
            }
            let trigger = Trigger::try_from(snapshot.trigger)?;
            let due_at = if snapshot.due_at > now {
                snapshot.due_at
            } else {
                match policy {
                    CatchUpPolicy::RunImmediately => now,
                    CatchUpPolicy::SkipMissed => {
                        match advance_past(&trigger, snapshot.due_at, now) {
                            Some(next) => next,
                            None => {
                                tracing::debug!(id = %snapshot.id, "dropping missed one-shot job");
                                continue;
                            }
                        }
                    }
                }
            };

            let id = snapshot.id;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.next_id = inner.next_id.max(id.0 + 1);

            let job = Job {
                id,
                state: JobState::Pending,
                handler: snapshot.handler,
                payload: snapshot.payload,
                trigger,
                overlap: snapshot.overlap,
                attempt: 0,
                max_attempts: snapshot.max_attempts.max(1),
                timeout: snapshot.timeout_ms.map(Duration::from_millis),
                errors: Vec::new(),
                runs: 0,
                submitted_at: snapshot.submitted_at,
                due_at,
                started_at: None,
                finished_at: None,
                cancel_requested: false,
            };
            events.push(event(&job, JobState::Pending, now));
            inner.queue.push(crate::queue::DueEntry {
                due_at,
                seq,
                id,
                epoch: 0,
            });
            inner.jobs.insert(
                id,
                JobRecord {
                    job,
                    epoch: 0,
                    cancellation: CancellationToken::new(),
                },
            );
        }
        drop(inner);

        let restored = events.len();
        for event in events {
            self.events.publish(event);
        }
        Ok(restored)
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryInner>, SchedulerError> {
        self.inner.lock().map_err(|_| SchedulerError::BadState)
    }
}

fn event(job: &Job, state: JobState, at: DateTime<Utc>) -> JobEvent {
    JobEvent {
        id: job.id,
        handler: job.handler.clone(),
        state,
        at,
    }
}

/// Next occurrence of a recurring job after the run anchored at
/// `job.due_at`. Under [`OverlapPolicy::Skip`] the result is advanced past
/// `now`, stepping occurrence by occurrence to preserve the trigger's phase.
fn next_occurrence(job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut next = job.trigger.next_fire(job.due_at)?;
    if job.overlap == OverlapPolicy::Skip {
        while next <= now {
            next = job.trigger.next_fire(next)?;
        }
    }
    Some(next)
}

/// Advances `anchor` occurrence by occurrence until it lies in the future.
/// `None` when the trigger has no future occurrence (a missed one-shot).
fn advance_past(
    trigger: &Trigger,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut next = anchor;
    while next <= now {
        next = trigger.next_fire(next)?;
    }
    Some(next)
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn one_shot(handler: &str, due_in: TimeDelta) -> NewJob {
        NewJob {
            handler: handler.to_owned(),
            payload: serde_json::Value::Null,
            trigger: Trigger::Once(Utc::now() + due_in),
            overlap: OverlapPolicy::default(),
            max_attempts: 1,
            timeout: None,
        }
    }

    fn recurring(interval: TimeDelta, overlap: OverlapPolicy) -> NewJob {
        NewJob {
            handler: "recurring".to_owned(),
            payload: serde_json::Value::Null,
            trigger: Trigger::Every(interval),
            overlap,
            max_attempts: 1,
            timeout: None,
        }
    }

    fn far_future() -> DateTime<Utc> {
        Utc::now() + TimeDelta::hours(1)
    }

    fn failure() -> RunOutcome {
        RunOutcome::Failed {
            kind: ErrorKind::Handler("flaky".to_owned()),
            details: "it broke".to_owned(),
        }
    }

    #[test]
    fn submitted_job_is_pending() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();

        assert_eq!(registry.state(id).unwrap(), JobState::Pending);
        let job = registry.job(id).unwrap();
        assert_eq!(job.handler, "transcode");
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn invalid_trigger_registers_nothing() {
        let registry = JobRegistry::new();
        let result = registry.insert(one_shot("transcode", TimeDelta::minutes(-5)));

        assert_matches!(result, Err(SchedulerError::InvalidTrigger(_)));
        assert_eq!(registry.snapshot().unwrap().len(), 0);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = JobRegistry::new();

        assert_matches!(
            registry.state(JobId::from(7)),
            Err(SchedulerError::NotFound(_))
        );
    }

    #[test]
    fn take_due_follows_due_time_order() {
        let registry = JobRegistry::new();
        let late = registry
            .insert(one_shot("late", TimeDelta::seconds(20)))
            .unwrap();
        let early = registry
            .insert(one_shot("early", TimeDelta::seconds(10)))
            .unwrap();

        assert_eq!(registry.take_due(far_future()).unwrap().unwrap().id, early);
        assert_eq!(registry.take_due(far_future()).unwrap().unwrap().id, late);
        assert!(registry.take_due(far_future()).unwrap().is_none());
    }

    #[test]
    fn equal_due_times_dispatch_in_submission_order() {
        let registry = JobRegistry::new();
        let at = Utc::now() + TimeDelta::seconds(10);
        let first = registry
            .insert(NewJob {
                trigger: Trigger::Once(at),
                ..one_shot("a", TimeDelta::zero())
            })
            .unwrap();
        let second = registry
            .insert(NewJob {
                trigger: Trigger::Once(at),
                ..one_shot("b", TimeDelta::zero())
            })
            .unwrap();

        assert_eq!(registry.take_due(far_future()).unwrap().unwrap().id, first);
        assert_eq!(registry.take_due(far_future()).unwrap().unwrap().id, second);
    }

    #[test]
    fn jobs_are_not_taken_before_their_due_time() {
        let registry = JobRegistry::new();
        registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();

        assert!(registry.take_due(Utc::now()).unwrap().is_none());
    }

    #[test]
    fn take_due_marks_running() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(one_shot("transcode", TimeDelta::zero()))
            .unwrap();

        let dispatched = registry.take_due(far_future()).unwrap().unwrap();
        assert_eq!(dispatched.attempt, 1);
        assert_eq!(registry.state(id).unwrap(), JobState::Running);
    }

    #[test]
    fn cancelled_pending_job_never_dispatches() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();

        assert!(registry.cancel(id).unwrap());
        assert_eq!(registry.state(id).unwrap(), JobState::Cancelled);
        assert!(registry.take_due(far_future()).unwrap().is_none());
    }

    #[test]
    fn cancel_is_false_for_unknown_and_terminal_jobs() {
        let registry = JobRegistry::new();
        assert!(!registry.cancel(JobId::from(99)).unwrap());

        let id = registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();
        assert!(registry.cancel(id).unwrap());
        // Already cancelled: terminal states are immutable.
        assert!(!registry.cancel(id).unwrap());
    }

    #[test]
    fn cancelling_a_running_job_is_a_cooperative_request() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(one_shot("transcode", TimeDelta::zero()))
            .unwrap();
        let dispatched = registry.take_due(far_future()).unwrap().unwrap();

        assert!(!registry.cancel(id).unwrap());
        assert_eq!(registry.state(id).unwrap(), JobState::Running);
        assert!(dispatched.cancellation.is_cancelled());
        assert!(registry.job(id).unwrap().cancel_requested);
    }

    #[test]
    fn settled_one_shot_succeeds() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(one_shot("transcode", TimeDelta::zero()))
            .unwrap();
        registry.take_due(far_future()).unwrap().unwrap();

        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        let job = registry.job(id).unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.runs, 1);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn recurring_job_reenters_pending_anchored_on_previous_fire() {
        let registry = JobRegistry::new();
        let interval = TimeDelta::minutes(10);
        let id = registry
            .insert(recurring(interval, OverlapPolicy::Queue))
            .unwrap();
        let first_due = registry.job(id).unwrap().due_at;

        registry.take_due(far_future()).unwrap().unwrap();
        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        let job = registry.job(id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt, 0);
        // Anchored on the fire time, not on completion time: no drift.
        assert_eq!(job.due_at, first_due + interval);
    }

    #[test]
    fn skip_policy_advances_past_missed_occurrences() {
        let registry = JobRegistry::new();
        let interval = TimeDelta::milliseconds(10);
        let id = registry
            .insert(recurring(interval, OverlapPolicy::Skip))
            .unwrap();
        let first_due = registry.job(id).unwrap().due_at;

        registry.take_due(far_future()).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        let job = registry.job(id).unwrap();
        assert!(job.due_at > Utc::now() - TimeDelta::milliseconds(10));
        // The phase of the original cadence is preserved.
        assert_eq!(
            (job.due_at - first_due).num_milliseconds() % interval.num_milliseconds(),
            0
        );
    }

    #[test]
    fn queue_policy_dispatches_missed_occurrences_late() {
        let registry = JobRegistry::new();
        let interval = TimeDelta::milliseconds(10);
        let id = registry
            .insert(recurring(interval, OverlapPolicy::Queue))
            .unwrap();
        let first_due = registry.job(id).unwrap().due_at;

        registry.take_due(far_future()).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        // The missed occurrence is kept even though it is already due.
        assert_eq!(registry.job(id).unwrap().due_at, first_due + interval);
        assert!(registry.take_due(Utc::now()).unwrap().is_some());
    }

    #[test]
    fn failed_run_retries_with_backoff_then_fails() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(NewJob {
                max_attempts: 2,
                ..one_shot("transcode", TimeDelta::zero())
            })
            .unwrap();

        registry.take_due(far_future()).unwrap().unwrap();
        registry
            .settle(id, failure(), TimeDelta::seconds(5))
            .unwrap();

        let job = registry.job(id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.errors.len(), 1);
        assert!(job.due_at > Utc::now() + TimeDelta::seconds(4));

        let retried = registry.take_due(far_future()).unwrap().unwrap();
        assert_eq!(retried.attempt, 2);
        registry
            .settle(id, failure(), TimeDelta::seconds(5))
            .unwrap();

        let job = registry.job(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.errors.len(), 2);
        assert_matches!(job.errors[0].kind, ErrorKind::Handler(_));
    }

    #[test]
    fn cancellation_request_stops_recurrence() {
        let registry = JobRegistry::new();
        let id = registry
            .insert(recurring(TimeDelta::minutes(10), OverlapPolicy::Queue))
            .unwrap();
        registry.take_due(far_future()).unwrap().unwrap();

        assert!(!registry.cancel(id).unwrap());
        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        // The in-flight run kept its natural terminal state, but no further
        // occurrence was scheduled.
        assert_eq!(registry.state(id).unwrap(), JobState::Succeeded);
        assert!(registry.take_due(far_future()).unwrap().is_none());
    }

    #[test]
    fn prune_by_age_removes_only_old_terminal_jobs() {
        let registry = JobRegistry::new();
        let done = registry
            .insert(one_shot("transcode", TimeDelta::zero()))
            .unwrap();
        registry.take_due(far_future()).unwrap().unwrap();
        registry
            .settle(done, RunOutcome::Done, TimeDelta::zero())
            .unwrap();
        let pending = registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();

        let spec = Pruner::max_age(TimeDelta::zero(), JobState::Succeeded);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(registry.prune(&spec).unwrap(), 1);

        assert_matches!(registry.state(done), Err(SchedulerError::NotFound(_)));
        assert_eq!(registry.state(pending).unwrap(), JobState::Pending);
    }

    #[test]
    fn prune_by_count_keeps_the_newest() {
        let registry = JobRegistry::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = registry
                .insert(one_shot("transcode", TimeDelta::zero()))
                .unwrap();
            registry.take_due(far_future()).unwrap().unwrap();
            registry
                .settle(id, RunOutcome::Done, TimeDelta::zero())
                .unwrap();
            ids.push(id);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let spec = Pruner::max_count(1, JobState::Succeeded);
        assert_eq!(registry.prune(&spec).unwrap(), 2);

        assert_matches!(registry.state(ids[0]), Err(SchedulerError::NotFound(_)));
        assert_matches!(registry.state(ids[1]), Err(SchedulerError::NotFound(_)));
        assert_eq!(registry.state(ids[2]).unwrap(), JobState::Succeeded);
    }

    #[test]
    fn prune_refuses_non_terminal_states() {
        let registry = JobRegistry::new();
        registry
            .insert(one_shot("transcode", TimeDelta::minutes(5)))
            .unwrap();

        let spec = Pruner::max_count(0, JobState::Pending);
        assert_eq!(registry.prune(&spec).unwrap(), 0);
    }
}
