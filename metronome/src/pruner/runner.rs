use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::{registry::JobRegistry, TaskHandle};

use super::PrunerConfig;

/// Runs the configured pruners at each fire of their cron schedule until a
/// terminate message arrives.
pub(crate) struct PruneRunner {
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) config: PrunerConfig,
}

impl PruneRunner {
    pub(crate) fn spawn(self) -> TaskHandle {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("pruner schedule has no upcoming fire time");
                    break;
                };
                let delay = next.sub(Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => self.prune_all(),
                    _ = rx.recv() => break,
                }
            }
            tracing::debug!("shutting down job pruner");
        });

        TaskHandle {
            sender,
            handle: Some(handle),
        }
    }

    fn prune_all(&self) {
        for pruner in &self.config.pruners {
            match self.registry.prune(pruner) {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned, state = %pruner.state, "pruned {pruned} jobs"),
                Err(err) => tracing::error!(?err, "pruning failed: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use chrono::TimeDelta;

    use crate::{
        job::{JobState, OverlapPolicy},
        pruner::Pruner,
        registry::{NewJob, RunOutcome},
        trigger::Trigger,
        Message,
    };

    use super::*;

    #[tokio::test]
    async fn prunes_on_schedule_until_shut_down() {
        let registry = Arc::new(JobRegistry::new());
        let id = registry
            .insert(NewJob {
                handler: "transcode".to_owned(),
                payload: serde_json::Value::Null,
                trigger: Trigger::Once(Utc::now()),
                overlap: OverlapPolicy::default(),
                max_attempts: 1,
                timeout: None,
            })
            .unwrap();
        registry
            .take_due(Utc::now() + TimeDelta::hours(1))
            .unwrap()
            .unwrap();
        registry
            .settle(id, RunOutcome::Done, TimeDelta::zero())
            .unwrap();

        let config = PrunerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
            .with_pruner(Pruner::max_count(0, JobState::Succeeded));
        let mut handle = PruneRunner {
            registry: Arc::clone(&registry),
            config,
        }
        .spawn();

        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if registry.state(id).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("settled job should have been pruned within a schedule fire");

        let _ = handle.sender.send(Message::Terminate);
        handle.handle.take().unwrap().await.unwrap();
    }
}
