use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use sling_jobs::{backend::memory::InMemoryBackend, prelude::*};
use tracing_subscriber::EnvFilter;

const MAIL_TOPIC: &str = "org/apache/sling/demo/mail";
const REPORT_TOPIC: &str = "org/apache/sling/demo/report";

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let config = JobsConfig::from_env()
        .unwrap()
        .with_queue(QueueConfig::new("mail").with_topics([MAIL_TOPIC]));
    let mut manager = JobManager::new(InMemoryBackend::new(), config).unwrap();
    manager.register_consumer([MAIL_TOPIC], 0, Mailer).unwrap();
    manager.register_executor([REPORT_TOPIC], 0, Report).unwrap();
    manager.start().unwrap();

    let job = manager
        .create_job(MAIL_TOPIC)
        .property("to", "admin@example.com")
        .unwrap()
        .add()
        .await
        .unwrap();
    println!("Added job {} to queue {}", job.id, job.queue_name);

    manager
        .create_job(REPORT_TOPIC)
        .property("pages", 3)
        .unwrap()
        .schedule("report")
        .at(Utc::now() + TimeDelta::seconds(1))
        .cron("*/2 * * * * *")
        .add()
        .unwrap();

    let provider = manager.distribution_queue_provider("demo");
    let queue = provider.get_queue("publish").unwrap();
    for path in ["/content/a", "/content/b"] {
        let mut properties = Properties::new();
        properties.insert("path".to_owned(), serde_json::json!(path));
        queue
            .add(DistributionQueueItem::new(path, properties))
            .await
            .unwrap();
    }
    provider
        .enable_queue_processing(Arc::new(Publisher), ["publish"])
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    for scheduled in manager.scheduler().get_scheduled_jobs(None, 0, &[]).unwrap() {
        println!(
            "Scheduled job {} next runs at {:?}",
            scheduled.name(),
            scheduled.next_scheduled_execution()
        );
    }
    manager.graceful_shutdown().await.unwrap();
}

/// Sends mails from a separate task.
struct Mailer;

#[async_trait]
impl JobConsumer for Mailer {
    async fn process(&self, job: Job, completion: AsyncCompletion) -> ConsumerResult {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            println!("Mailed {:?}", job.properties.get("to"));
            let _ = completion.ok();
        });
        ConsumerResult::Async
    }
}

struct Report;

#[async_trait]
impl JobExecutor for Report {
    async fn process(&self, job: Job, context: JobExecutionContext) -> JobStatus {
        let pages = job
            .properties
            .get("pages")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1) as u32;
        context.init_progress(pages, None).await;
        for page in 1..=pages {
            if context.is_stopped() {
                return context.result().message("stopped").cancelled().into();
            }
            context.log(format!("Rendered page {page}")).await;
            context.increment_progress_count(1).await;
        }
        println!("Report job {} done", job.id);
        context.result().message(format!("{pages} pages")).succeeded().into()
    }
}

struct Publisher;

#[async_trait]
impl DistributionQueueProcessor for Publisher {
    async fn process(&self, queue_name: &str, entry: &DistributionQueueEntry) -> bool {
        println!(
            "Published {} from {queue_name} after {} attempt(s)",
            entry.id, entry.status.attempts
        );
        true
    }
}
