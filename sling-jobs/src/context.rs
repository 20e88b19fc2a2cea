//! The per invocation handle passed to an executor.
//!
//! A [`JobExecutionContext`] belongs to exactly one execution of one job. It lets the executor
//! report progress, write log entries, poll for a stop request, and hand the job off for
//! asynchronous completion.
//!
//! # Asynchronous processing
//!
//! An executor that wants to finish the job on another task calls
//! [`JobExecutionContext::mark_async`], returns [`crate::executor::JobStatus::Async`], and later
//! calls [`JobExecutionContext::async_processing_finished`] exactly once. The queue slot stays
//! occupied until then.
//!
//! ```
//! # use sling_jobs::prelude::*;
//! struct Mailer;
//!
//! #[async_trait]
//! impl JobExecutor for Mailer {
//!     async fn process(&self, _job: Job, context: JobExecutionContext) -> JobStatus {
//!         context.mark_async();
//!         tokio::spawn(async move {
//!             // talk to the mail server...
//!             let _ = context.async_processing_finished(JobExecutionResult::SUCCEEDED);
//!         });
//!         JobStatus::Async
//!     }
//! }
//! ```
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::TimeDelta;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::job::{
    handler::JobHandler,
    result::{JobExecutionResult, ResultBuilder},
    JobId, JobState, JobUpdate,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// `async_processing_finished` was called twice, or without `mark_async`.
    #[error("Job is not processed async {0}")]
    NotAsync(JobId),
}

/// Notified once when an asynchronously processed job finishes.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait AsyncHandler: Send + Sync {
    fn finished(&self, job_id: JobId, state: JobState, result: JobExecutionResult);
}

impl AsyncHandler for mpsc::UnboundedSender<(JobState, JobExecutionResult)> {
    fn finished(&self, job_id: JobId, state: JobState, result: JobExecutionResult) {
        let _ = self.send((state, result)).inspect_err(|_| {
            tracing::warn!(%job_id, "Async result for job {job_id} arrived after shutdown")
        });
    }
}

/// Maps the outcome of an execution to the state the job moves to.
///
/// `Queued` means the job is eligible for another attempt.
pub(crate) fn state_for(result: &JobExecutionResult, stop_requested: bool) -> JobState {
    if result.succeeded() {
        JobState::Succeeded
    } else if result.failed() {
        JobState::Queued
    } else if stop_requested {
        JobState::Stopped
    } else {
        JobState::Error
    }
}

#[derive(Clone)]
pub struct JobExecutionContext {
    inner: Arc<Inner>,
}

struct Inner {
    handler: Arc<JobHandler>,
    async_handler: Arc<dyn AsyncHandler>,
    has_init: AtomicBool,
    is_async: AtomicBool,
    marked_async: AtomicBool,
}

impl JobExecutionContext {
    pub(crate) fn new(handler: Arc<JobHandler>, async_handler: Arc<dyn AsyncHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler,
                async_handler,
                has_init: AtomicBool::new(false),
                is_async: AtomicBool::new(false),
                marked_async: AtomicBool::new(false),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.handler.job_id()
    }

    /// Starts progress tracking with `steps` steps and an optional estimated time to completion.
    ///
    /// Only the first call has any effect.
    pub async fn init_progress(&self, steps: u32, eta: Option<TimeDelta>) {
        if self
            .inner
            .has_init
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner
                .handler
                .persist(JobUpdate::StartProgress { steps, eta })
                .await;
        }
    }

    /// Ignored until [`JobExecutionContext::init_progress`] has been called.
    pub async fn increment_progress_count(&self, steps: u32) {
        if self.inner.has_init.load(Ordering::SeqCst) {
            self.inner
                .handler
                .persist(JobUpdate::ProgressCount(steps))
                .await;
        }
    }

    /// Ignored until [`JobExecutionContext::init_progress`] has been called.
    pub async fn update_progress(&self, eta: TimeDelta) {
        if self.inner.has_init.load(Ordering::SeqCst) {
            self.inner.handler.persist(JobUpdate::Eta(eta)).await;
        }
    }

    pub async fn log(&self, message: impl Into<String>) {
        self.inner
            .handler
            .persist(JobUpdate::Log(message.into()))
            .await;
    }

    /// Whether someone asked this job to stop.
    ///
    /// Stopping is cooperative, long running executors should poll this and return a cancelled
    /// result once it becomes `true`.
    pub fn is_stopped(&self) -> bool {
        self.inner.handler.is_stopped()
    }

    pub fn mark_async(&self) {
        self.inner.is_async.store(true, Ordering::SeqCst);
        self.inner.marked_async.store(true, Ordering::SeqCst);
    }

    /// Finishes an asynchronously processed job.
    ///
    /// Returns [`ContextError::NotAsync`] when [`JobExecutionContext::mark_async`] was never
    /// called or when the job has already been finished. This is a bug in the executor, the
    /// result is discarded.
    pub fn async_processing_finished(&self, result: JobExecutionResult) -> Result<(), ContextError> {
        let job_id = self.job_id();
        self.inner
            .is_async
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ContextError::NotAsync(job_id))?;

        let state = state_for(&result, self.is_stopped());
        tracing::debug!(%job_id, %state, "Async processing of job {job_id} finished");
        self.inner.async_handler.finished(job_id, state, result);
        Ok(())
    }

    pub fn result(&self) -> ResultBuilder {
        ResultBuilder::default()
    }

    pub(crate) fn was_marked_async(&self) -> bool {
        self.inner.marked_async.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::*;

    use super::*;
    use crate::{backend::test::MockStore, job::Job};

    impl JobExecutionContext {
        pub(crate) fn mock(backend: MockStore, async_handler: MockAsyncHandler) -> Self {
            Self::mock_for(Job::raw_job(), backend, async_handler)
        }

        pub(crate) fn mock_for(
            job: Job,
            backend: MockStore,
            async_handler: MockAsyncHandler,
        ) -> Self {
            let handler = Arc::new(JobHandler::new(job, Arc::new(backend)));
            Self::new(handler, Arc::new(async_handler))
        }
    }

    fn async_handler_expecting(state: JobState) -> MockAsyncHandler {
        let mut async_handler = MockAsyncHandler::new();
        async_handler
            .expect_finished()
            .with(eq(JobId::from(0)), eq(state), always())
            .times(1)
            .return_const(());
        async_handler
    }

    #[test]
    fn async_finished_maps_result_to_state() {
        let cases = [
            (JobExecutionResult::SUCCEEDED, JobState::Succeeded),
            (JobExecutionResult::FAILED, JobState::Queued),
            (JobExecutionResult::CANCELLED, JobState::Error),
        ];
        for (result, state) in cases {
            let context =
                JobExecutionContext::mock(MockStore::new(), async_handler_expecting(state));
            context.mark_async();
            assert!(context.async_processing_finished(result).is_ok());
        }
    }

    #[test]
    fn async_cancelled_after_stop_request_is_stopped() {
        let job = Job {
            stop_requested: true,
            ..Job::raw_job()
        };
        let context = JobExecutionContext::mock_for(
            job,
            MockStore::new(),
            async_handler_expecting(JobState::Stopped),
        );
        context.mark_async();

        assert!(context
            .async_processing_finished(JobExecutionResult::CANCELLED)
            .is_ok());
    }

    #[test]
    fn async_finished_without_mark_async_fails() {
        let mut async_handler = MockAsyncHandler::new();
        async_handler.expect_finished().never();
        let context = JobExecutionContext::mock(MockStore::new(), async_handler);

        assert_matches!(
            context.async_processing_finished(JobExecutionResult::SUCCEEDED),
            Err(ContextError::NotAsync(id)) if id == JobId::from(0)
        );
    }

    #[test]
    fn async_finished_twice_fails() {
        let context = JobExecutionContext::mock(
            MockStore::new(),
            async_handler_expecting(JobState::Succeeded),
        );
        context.mark_async();
        context.mark_async();

        assert!(context
            .async_processing_finished(JobExecutionResult::SUCCEEDED)
            .is_ok());
        assert_matches!(
            context.async_processing_finished(JobExecutionResult::SUCCEEDED),
            Err(ContextError::NotAsync(_))
        );
        assert!(context.was_marked_async());
    }

    #[tokio::test]
    async fn init_progress_only_persists_once() {
        let mut backend = MockStore::new();
        backend
            .expect_apply_update()
            .withf(|_, update| matches!(update, JobUpdate::StartProgress { steps: 10, .. }))
            .times(1)
            .returning(|_, _| Ok(()));
        let context = JobExecutionContext::mock(backend, MockAsyncHandler::new());

        for _ in 0..3 {
            context.init_progress(10, None).await;
        }
    }

    #[tokio::test]
    async fn progress_updates_ignored_before_init() {
        let mut backend = MockStore::new();
        backend
            .expect_apply_update()
            .withf(|_, update| matches!(update, JobUpdate::Log(_)))
            .times(1)
            .returning(|_, _| Ok(()));
        let context = JobExecutionContext::mock(backend, MockAsyncHandler::new());

        context.increment_progress_count(1).await;
        context.update_progress(TimeDelta::seconds(5)).await;
        context.log("still logged").await;
    }

    #[tokio::test]
    async fn progress_updates_after_init() {
        let mut backend = MockStore::new();
        backend
            .expect_apply_update()
            .times(3)
            .returning(|_, _| Ok(()));
        let context = JobExecutionContext::mock(backend, MockAsyncHandler::new());

        context.init_progress(2, Some(TimeDelta::minutes(1))).await;
        context.increment_progress_count(1).await;
        context.update_progress(TimeDelta::seconds(30)).await;
    }

    #[test]
    fn state_mapping() {
        assert_eq!(
            state_for(&JobExecutionResult::SUCCEEDED, true),
            JobState::Succeeded
        );
        assert_eq!(state_for(&JobExecutionResult::FAILED, true), JobState::Queued);
        assert_eq!(
            state_for(&JobExecutionResult::CANCELLED, true),
            JobState::Stopped
        );
        assert_eq!(
            state_for(&JobExecutionResult::CANCELLED, false),
            JobState::Error
        );
    }
}
