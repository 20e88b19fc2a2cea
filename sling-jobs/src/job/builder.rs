use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use super::{check_topic, Job, JobState, Properties};
use crate::{
    backend::{Backend, EnqueuableJob},
    config::{JobsConfig, QueueType},
    scheduling::{JobAdder, JobScheduleBuilder, JobScheduler},
    JobsError,
};

/// Routes new jobs to the queue configured for their topic.
pub(crate) struct Enqueuer {
    backend: Arc<dyn Backend>,
    config: Arc<JobsConfig>,
}

impl Enqueuer {
    pub(crate) fn new(backend: Arc<dyn Backend>, config: Arc<JobsConfig>) -> Self {
        Self { backend, config }
    }
}

#[async_trait]
impl JobAdder for Enqueuer {
    async fn add_job(&self, topic: &str, properties: Properties) -> Result<Job, JobsError> {
        check_topic(topic).inspect_err(|err| tracing::warn!(%err, "{err}"))?;
        let queue = self.config.queue_for(topic);
        let job = self
            .backend
            .enqueue(EnqueuableJob {
                topic: topic.to_owned(),
                queue_name: queue.name.clone(),
                properties,
                max_retries: queue.max_retries,
                scheduled_at: Utc::now(),
            })
            .await?;
        let (job_id, queue_name) = (job.id, &job.queue_name);
        if queue.queue_type == QueueType::Drop {
            tracing::debug!(%job_id, %topic, %queue_name, "Dropping job {job_id} due to configuration of queue {queue_name}");
            self.backend.mark_finished(job_id, JobState::Dropped).await?;
            return Ok(self.backend.load(job_id).await?.unwrap_or(Job {
                state: JobState::Dropped,
                ..job
            }));
        }
        tracing::debug!(%job_id, %topic, %queue_name, "Added job {job_id} to queue {queue_name}");
        Ok(job)
    }
}

/// Builds a job for a topic. The job is either added right away or scheduled.
#[must_use]
pub struct JobBuilder {
    enqueuer: Arc<Enqueuer>,
    scheduler: JobScheduler,
    topic: String,
    properties: Properties,
}

impl JobBuilder {
    pub(crate) fn new(enqueuer: Arc<Enqueuer>, scheduler: JobScheduler, topic: String) -> Self {
        Self {
            enqueuer,
            scheduler,
            topic,
            properties: Properties::new(),
        }
    }

    /// Sets a single property, replacing an earlier value for the same key.
    pub fn property(
        self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, JobsError> {
        let mut properties = self.properties;
        properties.insert(key.into(), serde_json::to_value(value)?);
        Ok(Self { properties, ..self })
    }

    /// Adds all `properties`, replacing earlier values for the same keys.
    pub fn properties(self, properties: Properties) -> Self {
        let mut merged = self.properties;
        merged.extend(properties);
        Self {
            properties: merged,
            ..self
        }
    }

    pub async fn add(self) -> Result<Job, JobsError> {
        self.enqueuer.add_job(&self.topic, self.properties).await
    }

    /// Continues as a scheduled job called `name`. The job is added every time one of its
    /// schedules fires.
    pub fn schedule(self, name: impl Into<String>) -> JobScheduleBuilder {
        self.scheduler
            .builder(self.topic, self.properties, name.into())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, test::MockStore},
        config::QueueConfig,
        job::InvalidTopic,
        scheduler::Scheduler,
    };

    fn builder(backend: impl Backend + 'static, config: JobsConfig, topic: &str) -> JobBuilder {
        let enqueuer = Arc::new(Enqueuer::new(Arc::new(backend), Arc::new(config)));
        let scheduler = JobScheduler::new(Scheduler::new(), enqueuer.clone(), false);
        JobBuilder::new(enqueuer, scheduler, topic.to_owned())
    }

    #[tokio::test]
    async fn add_routes_job_to_configured_queue() {
        let config = JobsConfig::default().with_queue(
            QueueConfig::new("images")
                .with_topics(["org/apache/sling/image/*"])
                .with_max_retries(Some(2)),
        );
        let backend = InMemoryBackend::new().paused();

        let job = builder(backend.clone(), config, "org/apache/sling/image/resize")
            .property("width", 200)
            .unwrap()
            .add()
            .await
            .unwrap();

        assert_eq!(job.queue_name, "images");
        assert_eq!(job.max_retries, Some(2));
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.properties.get("width"), Some(&json!(200)));
        assert_eq!(backend.load(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn add_uses_main_queue_for_unmatched_topics() {
        let mut backend = MockStore::default();
        backend
            .expect_enqueue()
            .withf(|job| job.queue_name == "main" && job.max_retries == Some(10))
            .times(1)
            .returning(|job| {
                Ok(Job {
                    topic: job.topic,
                    queue_name: job.queue_name,
                    ..Job::raw_job()
                })
            });

        let job = builder(backend, JobsConfig::default(), "org/apache/sling/other")
            .add()
            .await
            .unwrap();
        assert_eq!(job.topic, "org/apache/sling/other");
    }

    #[tokio::test]
    async fn add_to_drop_queue_drops_job() {
        let config = JobsConfig::default().with_queue(
            QueueConfig::new("discard")
                .with_topics(["org/apache/sling/noise/-"])
                .with_queue_type(QueueType::Drop),
        );
        let backend = InMemoryBackend::new().paused();

        let job = builder(backend.clone(), config, "org/apache/sling/noise/ping")
            .add()
            .await
            .unwrap();

        assert_eq!(job.queue_name, "discard");
        assert_eq!(job.state, JobState::Dropped);
        assert_eq!(
            backend.load(job.id).await.unwrap().map(|job| job.state),
            Some(JobState::Dropped)
        );
    }

    #[tokio::test]
    async fn add_rejects_invalid_topic() {
        let mut backend = MockStore::default();
        backend.expect_enqueue().never();

        let result = builder(backend, JobsConfig::default(), "org/apache/*")
            .add()
            .await;
        assert_matches!(result, Err(JobsError::InvalidTopic(InvalidTopic(topic))) if topic == "org/apache/*");
    }

    #[tokio::test]
    async fn later_properties_replace_earlier_ones() {
        let mut extra = Properties::new();
        extra.insert("a".to_owned(), json!("replaced"));
        extra.insert("b".to_owned(), json!(true));
        let backend = InMemoryBackend::new().paused();

        let job = builder(backend, JobsConfig::default(), Job::DEFAULT_TOPIC)
            .property("a", "original")
            .unwrap()
            .properties(extra)
            .add()
            .await
            .unwrap();

        assert_eq!(job.properties.get("a"), Some(&json!("replaced")));
        assert_eq!(job.properties.get("b"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn schedule_keeps_topic_and_properties() {
        let scheduled = builder(
            InMemoryBackend::new().paused(),
            JobsConfig::default(),
            Job::DEFAULT_TOPIC,
        )
        .property("kind", "cleanup")
        .unwrap()
        .schedule("cleanup")
        .hourly(5)
        .add()
        .unwrap();

        assert_eq!(scheduled.name(), "cleanup");
        assert_eq!(scheduled.topic(), Job::DEFAULT_TOPIC);
        assert_eq!(scheduled.properties().get("kind"), Some(&json!("cleanup")));
    }
}
