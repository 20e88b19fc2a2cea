use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use tokio::{sync::mpsc, task::JoinError};
use tracing::{instrument, Instrument};

use crate::{
    backend::Backend,
    config::{QueueConfig, QueueType},
    context::{state_for, JobExecutionContext},
    executor::{registry::ConsumerRegistry, JobStatus},
    job::result::{JobExecutionResult, ResultBuilder},
    scheduler::executor::panic_message,
};

use super::{handler::JobHandler, Job, JobId, JobState, JobUpdate};

/// Handlers of the jobs currently being processed, shared by all queues so stop requests reach
/// running executors.
pub(crate) type ActiveJobs = RwLock<FxHashMap<JobId, Arc<JobHandler>>>;

pub(crate) struct JobRunner {
    backend: Arc<dyn Backend>,
    registry: Arc<ConsumerRegistry>,
    queue: QueueConfig,
    active: Arc<ActiveJobs>,
}

impl JobRunner {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<ConsumerRegistry>,
        queue: QueueConfig,
        active: Arc<ActiveJobs>,
    ) -> Self {
        Self {
            backend,
            registry,
            queue,
            active,
        }
    }

    #[instrument(skip(self, job), fields(job_id, queue = %self.queue.name))]
    pub(crate) async fn execute_job(&self, job: Job) {
        let job_id = job.id;
        tracing::Span::current().record("job_id", tracing::field::debug(&job_id));

        let executor = match self.registry.executor_for(&job.topic) {
            Ok(Some(executor)) => executor,
            Ok(None) => {
                let topic = &job.topic;
                tracing::warn!(%job_id, %topic, "No executor registered for {topic}, dropping job {job_id}");
                return self.mark_finished(job_id, JobState::Dropped).await;
            }
            Err(err) => {
                tracing::error!(?err, %job_id, "Failed to look up executor for job {job_id}");
                return self.mark_finished(job_id, JobState::Error).await;
            }
        };

        let handler = Arc::new(JobHandler::new(job.clone(), self.backend.clone()));
        if let Ok(mut active) = self.active.write() {
            active.insert(job_id, handler.clone());
        }

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let context = JobExecutionContext::new(handler.clone(), Arc::new(sender));
        tracing::debug!(%job_id, "Executing job {job_id}");
        let status = tokio::spawn({
            let context = context.clone();
            async move { executor.process(job, context).await }.in_current_span()
        })
        .await;

        let (state, result) = match status {
            Ok(JobStatus::Finished(result)) => (state_for(&result, handler.is_stopped()), result),
            Ok(JobStatus::Async) if context.was_marked_async() => {
                tracing::debug!(%job_id, "Job {job_id} continues asynchronously");
                // Only the executor's copies of the context may keep the channel open.
                drop(context);
                receiver.recv().await.unwrap_or_else(|| {
                    tracing::error!(%job_id, "Job {job_id} was dropped before finishing asynchronously");
                    error_result("Context dropped before async processing finished")
                })
            }
            Ok(JobStatus::Async) => {
                tracing::error!(%job_id, "Job {job_id} returned Async without calling mark_async");
                error_result("Async returned without mark_async")
            }
            Err(err) => {
                let message = join_error_message(err);
                tracing::error!(%job_id, "Job {job_id} panicked: {message}");
                error_result(message)
            }
        };

        let hold = self.finish(&handler, state, result).await;
        if let Ok(mut active) = self.active.write() {
            active.remove(&job_id);
        }
        if let Some(delay) = hold {
            // Keeps the only slot of an ordered queue until the retry is due.
            tokio::time::sleep(delay).await;
        }
    }

    /// Returns how long the queue has to wait before running anything else.
    async fn finish(
        &self,
        handler: &JobHandler,
        state: JobState,
        result: JobExecutionResult,
    ) -> Option<Duration> {
        let job_id = handler.job_id();
        if let Some(message) = result.message() {
            handler
                .persist(JobUpdate::ResultMessage(message.to_owned()))
                .await;
        }

        match state {
            JobState::Succeeded if !self.queue.keep_jobs => {
                tracing::debug!(%job_id, "Job succeeded {job_id}");
                let _ = self
                    .backend
                    .remove_job(job_id)
                    .await
                    .inspect_err(|err| {
                        tracing::error!(
                            ?err,
                            %job_id,
                            "Failed to remove succeeded job {job_id}, error: {err:?}",
                        )
                    });
            }
            JobState::Queued => {
                let (retry_count, max_retries) = handler
                    .job()
                    .map(|job| (job.retry_count + 1, job.max_retries))
                    .unwrap_or((1, Some(0)));
                if max_retries.is_some_and(|max_retries| retry_count > max_retries) {
                    tracing::error!(%job_id, retry_count, "Job {job_id} failed and will not be retried");
                    self.mark_finished(job_id, JobState::Failed).await;
                } else {
                    let delay = result.retry_delay().unwrap_or(self.queue.retry_delay);
                    tracing::warn!(%job_id, retry_count, "Job {job_id} failed and will be retried in {delay:?}");
                    if self.queue.queue_type == QueueType::Ordered {
                        // The original schedule keeps the job ahead of everything queued after it.
                        let scheduled_at = handler
                            .job()
                            .map_or_else(Utc::now, |job| job.scheduled_at);
                        self.mark_retry(job_id, retry_count, scheduled_at).await;
                        return Some(delay);
                    }
                    let scheduled_at = TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|delay| Utc::now().checked_add_signed(delay))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    self.mark_retry(job_id, retry_count, scheduled_at).await;
                }
            }
            state => {
                tracing::debug!(%job_id, %state, "Job {job_id} finished with {state}");
                self.mark_finished(job_id, state).await;
            }
        }
        None
    }

    async fn mark_finished(&self, job_id: JobId, state: JobState) {
        let _ = self
            .backend
            .mark_finished(job_id, state)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as {state}, error: {err:?}",
                )
            });
    }

    async fn mark_retry(&self, job_id: JobId, retry_count: u32, scheduled_at: DateTime<Utc>) {
        let _ = self
            .backend
            .mark_retry(job_id, retry_count, scheduled_at)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as retryable, error: {err:?}",
                )
            });
    }
}

fn error_result(message: impl Into<String>) -> (JobState, JobExecutionResult) {
    (
        JobState::Error,
        ResultBuilder::default().message(message).cancelled(),
    )
}

fn join_error_message(err: JoinError) -> String {
    let message = err.to_string();
    match err.try_into_panic() {
        Ok(panic) => panic_message(panic),
        Err(_) => message,
    }
}
