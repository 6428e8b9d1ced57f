//! Snapshot and restore of pending work.
//!
//! The scheduler itself persists nothing. A process that wants its pending
//! jobs to survive restarts exports them with [`crate::Scheduler::snapshot`],
//! stores the serialized snapshots wherever it likes, and reloads them on
//! startup via [`crate::SchedulerBuilder::restore`].
//!
//! Restore is idempotent: snapshots whose job id is already present are
//! ignored. Jobs whose fire time passed while the process was down are
//! handled per [`CatchUpPolicy`].

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    job::{Job, JobId, OverlapPolicy},
    trigger::{Trigger, TriggerError},
};

/// A portable record of one non-terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub handler: String,
    pub payload: serde_json::Value,
    pub trigger: TriggerSpec,
    pub overlap: OverlapPolicy,
    pub max_attempts: u16,
    pub timeout_ms: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            handler: job.handler.clone(),
            payload: job.payload.clone(),
            trigger: TriggerSpec::from(&job.trigger),
            overlap: job.overlap,
            max_attempts: job.max_attempts,
            timeout_ms: job.timeout.map(|timeout| timeout.as_millis() as u64),
            submitted_at: job.submitted_at,
            due_at: job.due_at,
        }
    }
}

/// Serializable form of a [`Trigger`]; cron schedules round-trip through
/// their source expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSpec {
    Once { at: DateTime<Utc> },
    Every { interval_ms: i64 },
    Cron { expression: String },
}

impl From<&Trigger> for TriggerSpec {
    fn from(trigger: &Trigger) -> Self {
        match trigger {
            Trigger::Once(at) => Self::Once { at: *at },
            Trigger::Every(interval) => Self::Every {
                interval_ms: interval.num_milliseconds(),
            },
            Trigger::Cron { expression, .. } => Self::Cron {
                expression: expression.clone(),
            },
        }
    }
}

impl TryFrom<TriggerSpec> for Trigger {
    type Error = TriggerError;

    fn try_from(spec: TriggerSpec) -> Result<Self, Self::Error> {
        match spec {
            TriggerSpec::Once { at } => Ok(Self::Once(at)),
            TriggerSpec::Every { interval_ms } => {
                Ok(Self::Every(TimeDelta::milliseconds(interval_ms)))
            }
            TriggerSpec::Cron { expression } => Self::cron(&expression),
        }
    }
}

/// How to treat restored jobs whose fire time passed while the process was
/// down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatchUpPolicy {
    /// Drop missed one-shot jobs; advance recurring jobs to their next future
    /// fire.
    #[default]
    SkipMissed,
    /// Make missed jobs due immediately.
    RunImmediately,
}
