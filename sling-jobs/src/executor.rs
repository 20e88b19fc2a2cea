//! The processing contracts implemented by users of the crate.
//!
//! There are two of them:
//!
//! - [`JobExecutor`] receives the job together with a [`JobExecutionContext`] and returns a
//!   [`JobStatus`]. This is the contract new code should implement.
//! - [`JobConsumer`] is the older, simpler contract returning a [`ConsumerResult`]. It is adapted
//!   to [`JobExecutor`] when registered.
//!
//! Executors are registered against topics in a [`registry::ConsumerRegistry`], see
//! [`crate::JobManager::register_executor`].
use async_trait::async_trait;

use crate::{
    context::{ContextError, JobExecutionContext},
    job::{result::JobExecutionResult, Job},
};

pub mod registry;

/// What an executor did with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Processing is over, the result decides the job's next state.
    Finished(JobExecutionResult),
    /// Processing continues elsewhere and will be finished through
    /// [`JobExecutionContext::async_processing_finished`].
    ///
    /// [`JobExecutionContext::mark_async`] has to be called before returning this, otherwise the
    /// job ends in [`crate::job::JobState::Error`].
    Async,
}

impl From<JobExecutionResult> for JobStatus {
    fn from(value: JobExecutionResult) -> Self {
        Self::Finished(value)
    }
}

/// Processes jobs of the topics it was registered for.
///
/// Panics are caught by the queue runtime and end the job in [`crate::job::JobState::Error`]
/// without a retry. Return a failed result to have the job retried.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn process(&self, job: Job, context: JobExecutionContext) -> JobStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerResult {
    Ok,
    /// Failed, the job may be retried.
    Failed,
    /// Failed permanently.
    Cancel,
    /// Processing continues elsewhere and will be finished through the [`AsyncCompletion`].
    Async,
}

/// The legacy processing contract.
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// `completion` may only be used when [`ConsumerResult::Async`] is returned.
    async fn process(&self, job: Job, completion: AsyncCompletion) -> ConsumerResult;
}

/// Finishes a job a [`JobConsumer`] processes asynchronously.
///
/// Only the first call of any of its methods has an effect, later calls return
/// [`ContextError::NotAsync`].
#[derive(Clone)]
pub struct AsyncCompletion {
    context: JobExecutionContext,
}

impl AsyncCompletion {
    pub fn ok(&self) -> Result<(), ContextError> {
        self.finish(self.context.result().succeeded())
    }

    pub fn failed(&self) -> Result<(), ContextError> {
        self.finish(self.context.result().failed())
    }

    pub fn cancel(&self) -> Result<(), ContextError> {
        self.finish(self.context.result().cancelled())
    }

    fn finish(&self, result: JobExecutionResult) -> Result<(), ContextError> {
        self.context.async_processing_finished(result)
    }
}

pub(crate) struct ConsumerAdapter<C>(pub(crate) C);

#[async_trait]
impl<C: JobConsumer> JobExecutor for ConsumerAdapter<C> {
    async fn process(&self, job: Job, context: JobExecutionContext) -> JobStatus {
        // The completion may fire before `process` returns.
        context.mark_async();
        let completion = AsyncCompletion {
            context: context.clone(),
        };
        match self.0.process(job, completion).await {
            ConsumerResult::Async => JobStatus::Async,
            ConsumerResult::Ok => context.result().succeeded().into(),
            ConsumerResult::Failed => context.result().failed().into(),
            ConsumerResult::Cancel => context.result().cancelled().into(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::*;

    use super::*;
    use crate::{backend::test::MockStore, context::MockAsyncHandler, job::JobState};

    /// Returns a fixed result for every job.
    pub(crate) struct Fixed(pub(crate) JobExecutionResult);

    #[async_trait]
    impl JobExecutor for Fixed {
        async fn process(&self, _job: Job, _context: JobExecutionContext) -> JobStatus {
            self.0.clone().into()
        }
    }

    struct Legacy(ConsumerResult);

    #[async_trait]
    impl JobConsumer for Legacy {
        async fn process(&self, _job: Job, completion: AsyncCompletion) -> ConsumerResult {
            if self.0 == ConsumerResult::Async {
                tokio::spawn(async move { completion.ok() });
            }
            self.0
        }
    }

    #[tokio::test]
    async fn consumer_results_are_translated() {
        let cases = [
            (ConsumerResult::Ok, JobExecutionResult::SUCCEEDED),
            (ConsumerResult::Failed, JobExecutionResult::FAILED),
            (ConsumerResult::Cancel, JobExecutionResult::CANCELLED),
        ];
        for (consumer_result, result) in cases {
            let context = JobExecutionContext::mock(MockStore::new(), MockAsyncHandler::new());
            let status = ConsumerAdapter(Legacy(consumer_result))
                .process(Job::raw_job(), context)
                .await;
            assert_eq!(status, JobStatus::Finished(result));
        }
    }

    #[tokio::test]
    async fn async_consumer_finishes_through_completion() {
        let (sender, receiver) = std::sync::mpsc::channel();
        let mut async_handler = MockAsyncHandler::new();
        async_handler
            .expect_finished()
            .with(always(), eq(JobState::Succeeded), always())
            .times(1)
            .returning(move |_, state, _| sender.send(state).unwrap());
        let context = JobExecutionContext::mock(MockStore::new(), async_handler);

        let status = ConsumerAdapter(Legacy(ConsumerResult::Async))
            .process(Job::raw_job(), context)
            .await;

        assert_eq!(status, JobStatus::Async);
        let state = tokio::task::spawn_blocking(move || receiver.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(state, JobState::Succeeded);
    }

    #[test]
    fn completion_only_finishes_once() {
        let mut async_handler = MockAsyncHandler::new();
        async_handler
            .expect_finished()
            .times(1)
            .return_const(());
        let context = JobExecutionContext::mock(MockStore::new(), async_handler);
        context.mark_async();
        let completion = AsyncCompletion { context };

        assert!(completion.failed().is_ok());
        assert_matches!(completion.cancel(), Err(ContextError::NotAsync(_)));
        assert_matches!(completion.ok(), Err(ContextError::NotAsync(_)));
    }

    #[test]
    fn job_status_from_result() {
        assert_eq!(
            JobStatus::from(JobExecutionResult::FAILED),
            JobStatus::Finished(JobExecutionResult::FAILED)
        );
    }
}
