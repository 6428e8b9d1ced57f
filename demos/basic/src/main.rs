use async_trait::async_trait;
use chrono::TimeDelta;
use futures::StreamExt;
use metronome::prelude::*;
use serde_json::json;

#[tokio::main]
pub async fn main() -> Result<(), SchedulerError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let scheduler = Scheduler::builder()
        .with_handler("transcode", TranscodeVideo)
        .with_handler("digest", SendDigest)
        .max_workers(4)
        .spawn()?;

    let events = scheduler.subscribe()?;
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            println!("{} [{}] -> {}", event.id, event.handler, event.state);
        }
    });

    let job_id = JobBuilder::new("transcode")
        .with_payload(json!({"course": 7, "lesson": "intro"}))?
        .schedule_in(TimeDelta::seconds(2))
        .with_max_attempts(2)
        .submit(&scheduler)?;
    println!("submitted one-shot {job_id}");

    let job_id = JobBuilder::new("digest")
        .every(TimeDelta::seconds(3))
        .with_overlap(OverlapPolicy::Skip)
        .submit(&scheduler)?;
    println!("submitted interval {job_id}");

    let job_id = JobBuilder::new("digest")
        .cron("*/5 * * * * *")
        .submit(&scheduler)?;
    println!("submitted cron {job_id}");

    tokio::time::sleep(std::time::Duration::from_secs(12)).await;
    scheduler.graceful_shutdown().await
}

struct TranscodeVideo;

#[async_trait]
impl JobHandler for TranscodeVideo {
    async fn run(&self, ctx: JobContext) -> ExecutionResult {
        println!("transcoding with args: {}", ctx.payload);
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        ExecutionResult::Done
    }
}

struct SendDigest;

#[async_trait]
impl JobHandler for SendDigest {
    async fn run(&self, ctx: JobContext) -> ExecutionResult {
        println!("sending digest (attempt {})", ctx.attempt);
        ExecutionResult::Done
    }
}
