use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::{
    job::{JobId, OverlapPolicy},
    registry::NewJob,
    trigger::Trigger,
    Scheduler, SchedulerError,
};

/// Fluent submission of a job.
///
/// Without a schedule the job is due immediately. Schedule and payload
/// validation happen at [`JobBuilder::submit`], synchronously.
///
/// ```no_run
/// # use metronome::{job::builder::JobBuilder, Scheduler, SchedulerError};
/// # use chrono::TimeDelta;
/// # use serde_json::json;
/// # async fn example(scheduler: &Scheduler) -> Result<(), SchedulerError> {
/// let job_id = JobBuilder::new("transcode")
///     .with_payload(json!({"course": 7}))?
///     .schedule_in(TimeDelta::minutes(5))
///     .with_max_attempts(3)
///     .submit(scheduler)?;
/// # Ok(())
/// # }
/// ```
pub struct JobBuilder {
    handler: String,
    payload: serde_json::Value,
    schedule: Schedule,
    overlap: OverlapPolicy,
    max_attempts: u16,
    timeout: Option<Duration>,
}

enum Schedule {
    Immediately,
    At(DateTime<Utc>),
    In(TimeDelta),
    Every(TimeDelta),
    Cron(String),
}

impl JobBuilder {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            payload: serde_json::Value::Null,
            schedule: Schedule::Immediately,
            overlap: OverlapPolicy::default(),
            max_attempts: 1,
            timeout: None,
        }
    }

    pub fn with_payload(self, payload: impl Serialize) -> Result<Self, SchedulerError> {
        Ok(Self {
            payload: serde_json::to_value(payload)?,
            ..self
        })
    }

    pub fn schedule_at(self, at: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::At(at),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            schedule: Schedule::In(delay),
            ..self
        }
    }

    /// Recur at a fixed interval, first firing one interval from submission.
    pub fn every(self, interval: TimeDelta) -> Self {
        Self {
            schedule: Schedule::Every(interval),
            ..self
        }
    }

    /// Recur on a cron expression (seconds-resolution syntax).
    pub fn cron(self, expression: impl Into<String>) -> Self {
        Self {
            schedule: Schedule::Cron(expression.into()),
            ..self
        }
    }

    pub fn with_overlap(self, overlap: OverlapPolicy) -> Self {
        Self { overlap, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Run budget for each run of this job, overriding the handler's and the
    /// scheduler's defaults.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn submit(self, scheduler: &Scheduler) -> Result<JobId, SchedulerError> {
        let trigger = match self.schedule {
            Schedule::Immediately => Trigger::Once(Utc::now()),
            Schedule::At(at) => Trigger::Once(at),
            Schedule::In(delay) => Trigger::Once(Utc::now() + delay),
            Schedule::Every(interval) => Trigger::Every(interval),
            Schedule::Cron(expression) => Trigger::cron(&expression)?,
        };
        scheduler.enqueue(NewJob {
            handler: self.handler,
            payload: self.payload,
            trigger,
            overlap: self.overlap,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
        })
    }
}
