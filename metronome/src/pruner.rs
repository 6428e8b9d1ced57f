//! Retention of settled jobs.
//!
//! Terminal jobs stay in the registry so callers can inspect their state and
//! recorded errors. In a long-lived process that history must be bounded:
//! [`PrunerConfig`] runs one or more [`Pruner`]s on a cron schedule, each
//! deleting terminal jobs matching its criteria.
//!
//! # Example
//!
//! Hourly, keep succeeded transcode jobs for a day and at most 200 failed
//! jobs overall:
//!
//! ```
//! use metronome::{job::JobState, pruner::{Pruner, PrunerConfig}};
//! use chrono::TimeDelta;
//! use std::str::FromStr;
//!
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_pruner(Pruner::max_age(TimeDelta::days(1), JobState::Succeeded).only("transcode"))
//!     .with_pruner(Pruner::max_count(200, JobState::Failed));
//! ```

use chrono::TimeDelta;

use crate::job::{Job, JobState};

pub(crate) mod runner;

/// When and what to prune. Passed to
/// [`crate::SchedulerBuilder::with_job_pruner`].
pub struct PrunerConfig {
    pub(crate) schedule: cron::Schedule,
    pub(crate) pruners: Vec<Pruner>,
}

impl PrunerConfig {
    /// A config that runs its pruners on the given cron schedule.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            pruners: Vec::new(),
        }
    }

    pub fn with_pruner(mut self, pruner: Pruner) -> Self {
        self.pruners.push(pruner);
        self
    }

    pub fn with_pruners(mut self, pruners: impl IntoIterator<Item = Pruner>) -> Self {
        self.pruners.extend(pruners);
        self
    }
}

/// A single retention rule over jobs in one terminal state.
///
/// By default a pruner applies to every handler; [`Pruner::only`] and
/// [`Pruner::except`] narrow it. The first call picks the mode, further
/// calls of the same kind extend the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pruner {
    pub(crate) state: JobState,
    pub(crate) prune_by: PruneBy,
    pub(crate) handlers: HandlerSpec,
}

impl Pruner {
    /// Deletes matching jobs that settled longer than `age` ago.
    pub const fn max_age(age: TimeDelta, state: JobState) -> Self {
        Self {
            state,
            prune_by: PruneBy::MaxAge(age),
            handlers: HandlerSpec::All,
        }
    }

    /// Keeps only the newest `count` matching jobs.
    pub const fn max_count(count: u32, state: JobState) -> Self {
        Self {
            state,
            prune_by: PruneBy::MaxCount(count),
            handlers: HandlerSpec::All,
        }
    }

    /// Restricts this pruner to jobs of the given handler tag.
    pub fn only(mut self, handler: &'static str) -> Self {
        match &mut self.handlers {
            HandlerSpec::Only(handlers) => handlers.push(handler),
            _ => self.handlers = HandlerSpec::Only(vec![handler]),
        }
        self
    }

    /// Excludes jobs of the given handler tag from this pruner.
    pub fn except(mut self, handler: &'static str) -> Self {
        match &mut self.handlers {
            HandlerSpec::Except(handlers) => handlers.push(handler),
            _ => self.handlers = HandlerSpec::Except(vec![handler]),
        }
        self
    }

    pub(crate) fn matches(&self, job: &Job) -> bool {
        job.state == self.state && self.handlers.matches(&job.handler)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PruneBy {
    MaxAge(TimeDelta),
    MaxCount(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandlerSpec {
    All,
    Only(Vec<&'static str>),
    Except(Vec<&'static str>),
}

impl HandlerSpec {
    fn matches(&self, handler: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(handlers) => handlers.contains(&handler),
            Self::Except(handlers) => !handlers.contains(&handler),
        }
    }
}
