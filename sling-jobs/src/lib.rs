//! Topic based job processing with scheduling and distribution queues.
//!
//! Jobs are added to a [`JobManager`] by topic. Every job is routed to the queue configured for
//! its topic and processed by the [`executor::JobExecutor`] registered for that topic:
//!
//! ```
//! use sling_jobs::prelude::*;
//! use sling_jobs::backend::memory::InMemoryBackend;
//!
//! struct Resize;
//!
//! #[async_trait]
//! impl JobExecutor for Resize {
//!     async fn process(&self, job: Job, context: JobExecutionContext) -> JobStatus {
//!         context.log(format!("Resizing {:?}", job.properties.get("path"))).await;
//!         context.result().message("done").succeeded().into()
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let mut manager = JobManager::new(InMemoryBackend::new(), JobsConfig::default()).unwrap();
//! manager
//!     .register_executor(["org/apache/sling/image/resize"], 0, Resize)
//!     .unwrap();
//! manager.start().unwrap();
//!
//! manager
//!     .create_job("org/apache/sling/image/resize")
//!     .property("path", "/content/dam/logo.png")
//!     .unwrap()
//!     .add()
//!     .await
//!     .unwrap();
//!
//! manager.graceful_shutdown().await.unwrap();
//! # });
//! ```
//!
//! Jobs can also be added on a schedule through [`JobManager::scheduler`] and
//! [`job::builder::JobBuilder::schedule`]. Ordered work that is not a job, for example content
//! distribution, goes through the queues of a
//! [`distribution::provider::SimpleDistributionQueueProvider`].
use std::sync::Arc;

use backend::{Backend, BackendError, Query};
use config::{ConfigError, JobsConfig, QueueConfig, QueueType};
use distribution::{provider::SimpleDistributionQueueProvider, DistributionQueueError};
use executor::{
    registry::{ConsumerRegistry, RegistrationId},
    ConsumerAdapter, JobConsumer, JobExecutor,
};
use futures::StreamExt;
use job::{
    builder::{Enqueuer, JobBuilder},
    runner::{ActiveJobs, JobRunner},
    InvalidTopic, Job, JobId, JobState, Properties,
};
use scheduler::Scheduler;
use scheduling::{JobAdder, JobScheduler, SchedulingError};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinHandle,
};
use tracing::Instrument;

pub mod backend;
pub mod config;
pub mod context;
pub mod distribution;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod scheduler;
pub mod scheduling;
pub mod testing;

/// Owns the job queues of one process.
///
/// Nothing is processed before [`JobManager::start`] is called. Jobs can be added and queried
/// without starting, they stay queued until a started manager picks them up.
pub struct JobManager {
    backend: Arc<dyn Backend>,
    config: Arc<JobsConfig>,
    registry: Arc<ConsumerRegistry>,
    active: Arc<ActiveJobs>,
    enqueuer: Arc<Enqueuer>,
    scheduler: Scheduler,
    job_scheduler: JobScheduler,
    queues: Vec<QueueHandle>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("config", &self.config)
            .field("job_scheduler", &self.job_scheduler)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct QueueHandle {
    name: String,
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl QueueHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), JobsError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| JobsError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| JobsError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

enum Message {
    Terminate,
}

impl JobManager {
    /// Fails when `config` does not validate.
    pub fn new(backend: impl Backend + 'static, config: JobsConfig) -> Result<Self, JobsError> {
        config.validate()?;
        let backend: Arc<dyn Backend> = Arc::new(backend);
        let config = Arc::new(config);
        let enqueuer = Arc::new(Enqueuer::new(backend.clone(), config.clone()));
        let scheduler = Scheduler::new();
        let job_scheduler = JobScheduler::new(
            scheduler.clone(),
            enqueuer.clone(),
            config.scheduler.enabled,
        );
        Ok(Self {
            backend,
            config,
            registry: Default::default(),
            active: Default::default(),
            enqueuer,
            scheduler,
            job_scheduler,
            queues: Vec::new(),
        })
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Registers `executor` for `topics`, either full topics or categories like `prefix/*`.
    ///
    /// Exact registrations win over categories, then the highest `ranking` wins.
    pub fn register_executor<T: AsRef<str>>(
        &self,
        topics: impl IntoIterator<Item = T>,
        ranking: i32,
        executor: impl JobExecutor + 'static,
    ) -> Result<RegistrationId, JobsError> {
        self.registry.register(topics, ranking, Arc::new(executor))
    }

    /// Registers a [`JobConsumer`], see [`JobManager::register_executor`].
    pub fn register_consumer<T: AsRef<str>>(
        &self,
        topics: impl IntoIterator<Item = T>,
        ranking: i32,
        consumer: impl JobConsumer + 'static,
    ) -> Result<RegistrationId, JobsError> {
        self.registry
            .register(topics, ranking, Arc::new(ConsumerAdapter(consumer)))
    }

    /// Returns whether the registration existed. Jobs already running are not affected.
    pub fn unregister(&self, id: RegistrationId) -> Result<bool, JobsError> {
        self.registry.unregister(id)
    }

    /// The registered topics, comma separated.
    pub fn topics(&self) -> Result<String, JobsError> {
        self.registry.topics()
    }

    /// Starts processing every configured queue. Calling it again has no effect.
    pub fn start(&mut self) -> Result<(), JobsError> {
        if !self.queues.is_empty() {
            return Ok(());
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| JobsError::NotInRuntime)?;
        self.queues = self
            .config
            .all_queues()
            .filter(|queue| {
                let ignored = queue.queue_type == QueueType::Ignore;
                if ignored {
                    tracing::debug!("Not processing jobs of ignored queue {}", queue.name);
                }
                !ignored
            })
            .map(|queue| self.spawn_queue(&runtime, queue.clone()))
            .collect();
        Ok(())
    }

    fn spawn_queue(&self, runtime: &tokio::runtime::Handle, queue: QueueConfig) -> QueueHandle {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let name = queue.name.clone();
        let backend = self.backend.clone();
        let runner = Arc::new(JobRunner::new(
            backend.clone(),
            self.registry.clone(),
            queue.clone(),
            self.active.clone(),
        ));

        let handle = runtime.spawn(
            async move {
                let slots = Arc::new(Semaphore::new(queue.parallelism()));
                let mut stream = backend.subscribe_ready_jobs(queue.name.clone()).await;
                tracing::debug!("Started job queue {}", queue.name);
                loop {
                    let permit = tokio::select! {
                        permit = slots.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                        _ = rx.recv() => break,
                    };
                    tokio::select! {
                        message = stream.next() => match message {
                            Some(Ok(job)) => {
                                let runner = runner.clone();
                                tokio::spawn(
                                    async move {
                                        runner.execute_job(job).await;
                                        drop(permit);
                                    }
                                    .in_current_span(),
                                );
                            }
                            Some(Err(error)) => {
                                tracing::warn!(?error, "Failed to get from stream: {error}")
                            }
                            None => break,
                        },
                        _ = rx.recv() => break,
                    }
                }
                tracing::debug!("Shutting down job queue {}", queue.name);
                let in_flight = u32::try_from(queue.parallelism()).unwrap_or(u32::MAX);
                let _ = slots.acquire_many(in_flight).await;
            }
            .in_current_span(),
        );

        QueueHandle {
            name,
            sender,
            handle: Some(handle),
        }
    }

    /// Adds a job with `properties`, see [`JobManager::create_job`] for a builder.
    pub async fn add_job(&self, topic: &str, properties: Properties) -> Result<Job, JobsError> {
        self.enqueuer.add_job(topic, properties).await
    }

    pub fn create_job(&self, topic: impl Into<String>) -> JobBuilder {
        JobBuilder::new(
            self.enqueuer.clone(),
            self.job_scheduler.clone(),
            topic.into(),
        )
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, JobsError> {
        Ok(self.backend.load(id).await?)
    }

    /// Jobs matching `query`, at most `limit` of them unless `limit` is 0.
    pub async fn find_jobs(&self, query: Query, limit: usize) -> Result<Vec<Job>, JobsError> {
        let mut jobs = self.backend.query(query).await?;
        if limit > 0 {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    /// Requests `id` to stop and returns its state afterwards.
    ///
    /// A queued job is stopped straight away. A running job keeps running until its executor
    /// checks [`context::JobExecutionContext::is_stopped`].
    pub async fn stop_job(&self, id: JobId) -> Result<JobState, JobsError> {
        let state = self.backend.request_stop(id).await?;
        let handler = self
            .active
            .read()
            .map_err(|_| JobsError::BadState)?
            .get(&id)
            .cloned();
        if let Some(handler) = handler {
            handler.stop();
        }
        tracing::debug!(job_id = %id, %state, "Stop requested for job {id}");
        Ok(state)
    }

    /// Removes `id`, stopping it first when it is running. Returns whether a job was removed.
    pub async fn remove_job(&self, id: JobId) -> Result<bool, JobsError> {
        let running = self
            .active
            .read()
            .map_err(|_| JobsError::BadState)?
            .contains_key(&id);
        if running {
            self.stop_job(id).await?;
        }
        Ok(self.backend.remove_job(id).await?)
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.job_scheduler
    }

    /// A provider whose queue processing runs on this manager's scheduler.
    pub fn distribution_queue_provider(
        &self,
        name: impl Into<String>,
    ) -> SimpleDistributionQueueProvider {
        SimpleDistributionQueueProvider::new(
            name,
            self.config.distribution.clone(),
            self.scheduler.clone(),
        )
    }

    /// Stops all schedules and waits for the jobs in flight to finish.
    pub async fn graceful_shutdown(mut self) -> Result<(), JobsError> {
        tracing::debug!("Shutting down job queues");
        // Shuts down the shared scheduler, distribution queue processing included.
        self.job_scheduler.shutdown()?;
        let results = futures::future::join_all(
            self.queues
                .iter_mut()
                .map(|queue| async move {
                    let name = queue.name.clone();
                    queue
                        .graceful_shutdown()
                        .await
                        .inspect_err(|err| tracing::error!(?err, %name, "Failed to stop queue {name}"))
                }),
        )
        .await;
        results.into_iter().collect()
    }
}

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the backend")]
    BackendError(#[from] BackendError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidTopic(#[from] InvalidTopic),
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error(transparent)]
    Distribution(#[from] DistributionQueueError),
    #[error("Job queues can only be started within a tokio runtime")]
    NotInRuntime,
    #[error("System in bad state")]
    BadState,
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        config::DistributionConfig,
        context::JobExecutionContext,
        distribution::{DistributionQueue, DistributionQueueItem},
        executor::{AsyncCompletion, ConsumerResult, JobStatus},
        scheduling::ScheduleInfo,
    };

    const TOPIC: &str = "org/apache/sling/jobs/test";

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl JobExecutor for Counting {
        async fn process(&self, _job: Job, context: JobExecutionContext) -> JobStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            context.result().succeeded().into()
        }
    }

    /// Runs until stopped.
    struct UntilStopped;

    #[async_trait]
    impl JobExecutor for UntilStopped {
        async fn process(&self, _job: Job, context: JobExecutionContext) -> JobStatus {
            while !context.is_stopped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            context.result().message("stopped").cancelled().into()
        }
    }

    /// Completes every job from a separate task.
    struct Later;

    #[async_trait]
    impl JobConsumer for Later {
        async fn process(&self, _job: Job, completion: AsyncCompletion) -> ConsumerResult {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                completion.ok().unwrap();
            });
            ConsumerResult::Async
        }
    }

    /// Records each attempt and fails the first attempt of the job named `first`.
    struct FailsFirstOnce(Arc<Mutex<Vec<(String, u32)>>>);

    #[async_trait]
    impl JobExecutor for FailsFirstOnce {
        async fn process(&self, job: Job, context: JobExecutionContext) -> JobStatus {
            let name = job
                .properties
                .get("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let retry = name == "first" && job.retry_count == 0;
            self.0.lock().unwrap().push((name, job.retry_count));
            if retry {
                context.result().failed().into()
            } else {
                context.result().succeeded().into()
            }
        }
    }

    fn keep_jobs() -> JobsConfig {
        JobsConfig::default().with_main_queue(QueueConfig::default().with_keep_jobs(true))
    }

    async fn wait_for_state(manager: &JobManager, id: JobId, state: JobState) -> Job {
        for _ in 0..500 {
            if let Some(job) = manager.get_job(id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("Job {id} never reached {state}");
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config =
            JobsConfig::default().with_main_queue(QueueConfig::default().with_max_parallel(0));
        let result = JobManager::new(InMemoryBackend::new(), config);
        assert_matches!(result, Err(JobsError::Config(_)));
    }

    #[test]
    fn start_requires_runtime() {
        let mut manager = JobManager::new(InMemoryBackend::new(), JobsConfig::default()).unwrap();
        assert_matches!(manager.start(), Err(JobsError::NotInRuntime));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn processes_added_job() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut manager = JobManager::new(InMemoryBackend::new(), keep_jobs()).unwrap();
        manager
            .register_executor([TOPIC], 0, Counting(count.clone()))
            .unwrap();
        manager.start().unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        let job = wait_for_state(&manager, job.id, JobState::Succeeded).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(job.finished.is_some());
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn succeeded_jobs_are_removed_by_default() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut manager = JobManager::new(InMemoryBackend::new(), JobsConfig::default()).unwrap();
        manager
            .register_executor([TOPIC], 0, Counting(count.clone()))
            .unwrap();
        manager.start().unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        for _ in 0..500 {
            if manager.get_job(job.id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(manager.get_job(job.id).await.unwrap(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumer_finishing_asynchronously() {
        let mut manager = JobManager::new(InMemoryBackend::new(), keep_jobs()).unwrap();
        manager.register_consumer([TOPIC], 0, Later).unwrap();
        manager.start().unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        wait_for_state(&manager, job.id, JobState::Succeeded).await;
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn job_without_executor_is_dropped() {
        let mut manager = JobManager::new(InMemoryBackend::new(), keep_jobs()).unwrap();
        manager.start().unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        wait_for_state(&manager, job.id, JobState::Dropped).await;
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_job_reaches_running_executor() {
        let mut manager = JobManager::new(InMemoryBackend::new(), keep_jobs()).unwrap();
        manager.register_executor([TOPIC], 0, UntilStopped).unwrap();
        manager.start().unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        wait_for_state(&manager, job.id, JobState::Active).await;
        assert_eq!(manager.stop_job(job.id).await.unwrap(), JobState::Active);

        let job = wait_for_state(&manager, job.id, JobState::Stopped).await;
        assert_eq!(job.result_message.as_deref(), Some("stopped"));
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ignored_queue_keeps_jobs_queued() {
        let count = Arc::new(AtomicUsize::new(0));
        let config = JobsConfig::default().with_main_queue(
            QueueConfig::default()
                .with_queue_type(QueueType::Ignore)
                .with_keep_jobs(true),
        );
        let mut manager = JobManager::new(InMemoryBackend::new(), config).unwrap();
        manager
            .register_executor([TOPIC], 0, Counting(count.clone()))
            .unwrap();
        manager.start().unwrap();
        assert!(manager.queues.is_empty());

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            manager.get_job(job.id).await.unwrap().map(|job| job.state),
            Some(JobState::Queued)
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ordered_queue_retries_failed_job_first() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let config = JobsConfig::default().with_main_queue(
            QueueConfig::default()
                .with_queue_type(QueueType::Ordered)
                .with_retry_delay(Duration::from_millis(50))
                .with_keep_jobs(true),
        );
        let mut manager = JobManager::new(InMemoryBackend::new(), config).unwrap();
        manager
            .register_executor([TOPIC], 0, FailsFirstOnce(attempts.clone()))
            .unwrap();
        for name in ["first", "second"] {
            manager
                .create_job(TOPIC)
                .property("name", name)
                .unwrap()
                .add()
                .await
                .unwrap();
        }
        manager.start().unwrap();

        let second = manager
            .find_jobs(Query::PropertyEquals("name".to_owned(), json!("second")), 0)
            .await
            .unwrap()
            .remove(0);
        wait_for_state(&manager, second.id, JobState::Succeeded).await;

        assert_eq!(
            *attempts.lock().unwrap(),
            vec![
                ("first".to_owned(), 0),
                ("first".to_owned(), 1),
                ("second".to_owned(), 0),
            ]
        );
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drop_queue_drops_added_job() {
        let config = JobsConfig::default()
            .with_main_queue(QueueConfig::default().with_queue_type(QueueType::Drop));
        let manager = JobManager::new(InMemoryBackend::new().paused(), config).unwrap();

        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();
        assert_eq!(job.state, JobState::Dropped);
        assert!(manager
            .find_jobs(Query::StateEqual(JobState::Queued), 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stop_job_stops_queued_job() {
        let manager = JobManager::new(InMemoryBackend::new().paused(), keep_jobs()).unwrap();
        let job = manager.add_job(TOPIC, Properties::new()).await.unwrap();

        assert_eq!(manager.stop_job(job.id).await.unwrap(), JobState::Stopped);
        assert!(manager.remove_job(job.id).await.unwrap());
        assert!(!manager.remove_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn find_jobs_honours_limit() {
        let manager = JobManager::new(InMemoryBackend::new().paused(), keep_jobs()).unwrap();
        for value in 0..3 {
            manager
                .create_job(TOPIC)
                .property("value", value)
                .unwrap()
                .add()
                .await
                .unwrap();
        }

        assert_eq!(manager.find_jobs(Query::all(), 0).await.unwrap().len(), 3);
        assert_eq!(manager.find_jobs(Query::all(), 2).await.unwrap().len(), 2);
        let found = manager
            .find_jobs(Query::PropertyEquals("value".to_owned(), json!(1)), 0)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn add_job_rejects_invalid_topic() {
        let manager = JobManager::new(InMemoryBackend::new().paused(), keep_jobs()).unwrap();
        let result = manager.add_job("", Properties::new()).await;
        assert_matches!(result, Err(JobsError::InvalidTopic(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scheduled_job_is_added_and_processed() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut manager = JobManager::new(InMemoryBackend::new(), keep_jobs()).unwrap();
        manager
            .register_executor([TOPIC], 0, Counting(count.clone()))
            .unwrap();
        manager.start().unwrap();

        let scheduled = manager
            .create_job(TOPIC)
            .schedule("soon")
            .at(Utc::now() + TimeDelta::milliseconds(200))
            .add()
            .unwrap();
        assert!(matches!(
            scheduled.schedules().as_slice(),
            [ScheduleInfo::Date(_)]
        ));

        // A date schedule fires once and is then removed.
        for _ in 0..500 {
            if count.load(Ordering::SeqCst) == 1
                && manager.scheduler().scheduled_job("soon").unwrap().is_none()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(manager.scheduler().scheduled_job("soon").unwrap().is_none());
        manager.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn distribution_provider_uses_config() {
        let config =
            JobsConfig::default().with_distribution(DistributionConfig::default().with_capacity(1));
        let manager = JobManager::new(InMemoryBackend::new().paused(), config).unwrap();
        let provider = manager.distribution_queue_provider("publish");
        let queue = provider.get_queue("agent").unwrap();
        assert!(queue
            .add(DistributionQueueItem::new("a", Properties::new()))
            .await
            .unwrap()
            .is_some());
        assert_eq!(provider.name(), "publish");
    }
}
