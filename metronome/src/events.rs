use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    job::{JobId, JobState},
    SchedulerError,
};

/// A job state transition, as observed through [`crate::Scheduler::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub id: JobId,
    pub handler: String,
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// Fan-out of lifecycle events to any number of subscribers.
///
/// Publishing is best-effort: subscribers that have gone away are dropped on
/// the next publish, and a slow subscriber never blocks a state transition.
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl EventBus {
    pub(crate) fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<JobEvent>, SchedulerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .map_err(|_| SchedulerError::BadState)?
            .push(sender);
        Ok(receiver)
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }
}
