//! Convenience re-exports of the types most programs need.
//!
//! ```
//! # #![allow(unused_imports)]
//! use metronome::prelude::*;
//! ```
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::events::JobEvent;
pub use crate::handler::{ExecutionError, ExecutionResult, JobContext, JobHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobState, OverlapPolicy};
pub use crate::pruner::{Pruner, PrunerConfig};
pub use crate::snapshot::{CatchUpPolicy, JobSnapshot};
pub use crate::trigger::Trigger;
pub use crate::{Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerError};
