//! Test suite for ensuring a correct implementation of a backend.
use std::time::Duration;

use chrono::TimeDelta;
use futures::StreamExt;

use super::*;

const DEFAULT_QUEUE: &str = "main";
const DELTA: TimeDelta = TimeDelta::milliseconds(1);

impl EnqueuableJob {
    pub(crate) const DEFAULT_TOPIC: &'static str = "org/apache/sling/jobs/test";

    pub(crate) fn mock_job() -> Self {
        Self {
            topic: Self::DEFAULT_TOPIC.to_owned(),
            queue_name: DEFAULT_QUEUE.to_owned(),
            properties: Properties::new(),
            max_retries: Some(3),
            scheduled_at: Utc::now(),
        }
    }

    pub(crate) fn with_topic(self, topic: impl ToString) -> Self {
        Self {
            topic: topic.to_string(),
            ..self
        }
    }

    pub(crate) fn with_queue(self, queue_name: impl ToString) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            ..self
        }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub(crate) fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_owned(), value);
        self
    }
}

/// Create test suite for a job backend.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use sling_jobs::test_suite;
/// use sling_jobs::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead:
///
/// ```ignore
/// use sling_jobs::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn subscribe_ready_jobs $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_enqueuing_wakes_subscriber $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_enqueuing_wakes_subscriber(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_streams_jobs_by_scheduled_at $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_streams_jobs_by_scheduled_at(backend).await;
        }
        #[$attr]
        async fn subscribe_ready_jobs_streams_only_one_steam_receives_job $args {
          let backend = $backend;
          $crate::backend::testing::subscribe_ready_jobs_streams_only_one_steam_receives_job(backend).await;
        }
        #[$attr]
        async fn enqueue $args {
          let backend = $backend;
          $crate::backend::testing::enqueue(backend).await;
        }
        #[$attr]
        async fn load_not_found $args {
          let backend = $backend;
          $crate::backend::testing::load_not_found(backend).await;
        }
        #[$attr]
        async fn apply_update $args {
          let backend = $backend;
          $crate::backend::testing::apply_update(backend).await;
        }
        #[$attr]
        async fn apply_update_not_found $args {
          let backend = $backend;
          $crate::backend::testing::apply_update_not_found(backend).await;
        }
        #[$attr]
        async fn mark_retry $args {
          let backend = $backend;
          $crate::backend::testing::mark_retry(backend).await;
        }
        #[$attr]
        async fn mark_retry_requires_active_job $args {
          let backend = $backend;
          $crate::backend::testing::mark_retry_requires_active_job(backend).await;
        }
        #[$attr]
        async fn mark_finished $args {
          let backend = $backend;
          $crate::backend::testing::mark_finished(backend).await;
        }
        #[$attr]
        async fn mark_finished_final_state_is_terminal $args {
          let backend = $backend;
          $crate::backend::testing::mark_finished_final_state_is_terminal(backend).await;
        }
        #[$attr]
        async fn mark_finished_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_finished_not_found(backend).await;
        }
        #[$attr]
        async fn request_stop_queued_job $args {
          let backend = $backend;
          $crate::backend::testing::request_stop_queued_job(backend).await;
        }
        #[$attr]
        async fn request_stop_active_job $args {
          let backend = $backend;
          $crate::backend::testing::request_stop_active_job(backend).await;
        }
        #[$attr]
        async fn remove_job $args {
          let backend = $backend;
          $crate::backend::testing::remove_job(backend).await;
        }
        #[$attr]
        async fn query $args {
          let backend = $backend;
          $crate::backend::testing::query(backend).await;
        }
    };
}

#[doc(hidden)]
#[async_trait::async_trait]
pub trait BackendTesting: Backend + Sync {
    /// Takes the next ready job of `queue_name`, leaving it active.
    ///
    /// This method should only be used if there is a single job enqueued for the queue,
    /// otherwise it might activate other jobs.
    async fn activate(&self, queue_name: &str) -> Job {
        let mut stream = self.subscribe_ready_jobs(queue_name.to_owned()).await;
        stream.next().await.unwrap().unwrap()
    }

    async fn get_job(&self, id: JobId) -> Option<Job> {
        let mut jobs = self.query(Query::IdEquals(id)).await.unwrap();
        assert!(jobs.len() <= 1);
        jobs.pop()
    }
}

impl<T: Backend + Sync> BackendTesting for T {}

#[doc(hidden)]
pub async fn subscribe_ready_jobs(backend: impl Backend) {
    let mut stream = backend.subscribe_ready_jobs(DEFAULT_QUEUE.into()).await;
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("another_queue"))
        .await
        .unwrap();
    let enqueued = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = stream.next().await.unwrap().unwrap();
    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.queue_name, DEFAULT_QUEUE);
    assert_eq!(job.state, JobState::Active);
    assert!(job.started.is_some());
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_enqueuing_wakes_subscriber(backend: impl Backend) {
    let mut stream = backend.subscribe_ready_jobs(DEFAULT_QUEUE.into()).await;
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(job))) => assert_eq!(job.queue_name, DEFAULT_QUEUE),
            Err(_) => panic!("Didn't get woken by enqueue of new job"),
            _ => panic!("Bad things happened"),
        }
    });
    tokio::task::yield_now().await;
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("another_queue"))
        .await
        .unwrap();
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    handle.await.unwrap();
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_streams_jobs_by_scheduled_at(backend: impl Backend) {
    let scheduled_at1 = Utc::now();
    let scheduled_at2 = Utc::now() + TimeDelta::milliseconds(500);
    let mut stream = backend.subscribe_ready_jobs(DEFAULT_QUEUE.into()).await;
    let job1 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at2))
        .await
        .unwrap();
    let job2 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at1))
        .await
        .unwrap();
    let job3 = backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(scheduled_at1))
        .await
        .unwrap();

    let job_ids: [JobId; 3] = [
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
        stream.next().await.unwrap().unwrap().id,
    ];
    assert_eq!(job_ids, [job2.id, job3.id, job1.id]);
}

#[doc(hidden)]
pub async fn subscribe_ready_jobs_streams_only_one_steam_receives_job(backend: impl Backend) {
    let mut stream1 = backend.subscribe_ready_jobs(DEFAULT_QUEUE.into()).await;
    let mut stream2 = backend.subscribe_ready_jobs(DEFAULT_QUEUE.into()).await;
    let job1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job_ids: std::collections::HashSet<_> =
        futures::future::join_all([stream1.next(), stream2.next()])
            .await
            .into_iter()
            .map(|res| res.unwrap().unwrap().id)
            .collect();
    let expected = [job1.id, job2.id].into_iter().collect();
    assert_eq!(job_ids, expected);
}

#[doc(hidden)]
pub async fn enqueue(backend: impl BackendTesting) {
    let job1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job2 = backend
        .enqueue(EnqueuableJob::mock_job().with_property("path", serde_json::json!("/content")))
        .await
        .unwrap();

    assert_ne!(job1.id, job2.id);
    assert_eq!(job1.state, JobState::Queued);
    assert_eq!(job1.retry_count, 0);
    assert_eq!(backend.get_job(job1.id).await, Some(job1));

    let stored = backend.load(job2.id).await.unwrap().unwrap();
    assert_eq!(
        stored.properties.get("path"),
        Some(&serde_json::json!("/content"))
    );
}

#[doc(hidden)]
pub async fn load_not_found(backend: impl BackendTesting) {
    assert!(backend.load(42.into()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn apply_update(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    backend
        .apply_update(job.id, JobUpdate::StartProgress { steps: 4, eta: None })
        .await
        .unwrap();
    backend
        .apply_update(job.id, JobUpdate::ProgressCount(1))
        .await
        .unwrap();
    backend
        .apply_update(job.id, JobUpdate::Log("step one".to_owned()))
        .await
        .unwrap();

    let job = backend.get_job(job.id).await.unwrap();
    let progress = job.progress.unwrap();
    assert_eq!(progress.total_steps, 4);
    assert_eq!(progress.finished_steps, 1);
    assert_eq!(job.log, vec!["step one"]);
}

#[doc(hidden)]
pub async fn apply_update_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .apply_update(42.into(), JobUpdate::Log("log".to_owned()))
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn mark_retry(backend: impl BackendTesting) {
    let scheduled_at = Utc::now() + TimeDelta::days(1);
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.activate(DEFAULT_QUEUE).await;

    assert!(backend.mark_retry(job.id, 1, scheduled_at).await.is_ok());

    let job = backend.get_job(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.retry_count, 1);
    assert!(job.started.is_none());
    assert!((job.scheduled_at - scheduled_at).abs() < DELTA);
}

#[doc(hidden)]
pub async fn mark_retry_requires_active_job(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(matches!(
        backend.mark_retry(job.id, 1, Utc::now()).await,
        Err(BackendError::InvalidTransition {
            from: JobState::Queued,
            to: JobState::Queued,
            ..
        })
    ));
}

#[doc(hidden)]
pub async fn mark_finished(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.activate(DEFAULT_QUEUE).await;

    assert!(backend
        .mark_finished(job.id, JobState::Succeeded)
        .await
        .is_ok());

    let job = backend.get_job(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.finished.is_some());
}

#[doc(hidden)]
pub async fn mark_finished_final_state_is_terminal(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.activate(DEFAULT_QUEUE).await;
    backend
        .mark_finished(job.id, JobState::Error)
        .await
        .unwrap();

    assert!(matches!(
        backend.mark_finished(job.id, JobState::Succeeded).await,
        Err(BackendError::InvalidTransition {
            from: JobState::Error,
            to: JobState::Succeeded,
            ..
        })
    ));
    assert_eq!(
        backend.get_job(job.id).await.unwrap().state,
        JobState::Error
    );
}

#[doc(hidden)]
pub async fn mark_finished_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend.mark_finished(42.into(), JobState::Succeeded).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn request_stop_queued_job(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_eq!(
        backend.request_stop(job.id).await.unwrap(),
        JobState::Stopped
    );
    let job = backend.get_job(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Stopped);
    assert!(job.stop_requested);
}

#[doc(hidden)]
pub async fn request_stop_active_job(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.activate(DEFAULT_QUEUE).await;

    assert_eq!(
        backend.request_stop(job.id).await.unwrap(),
        JobState::Active
    );
    let job = backend.get_job(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Active);
    assert!(job.stop_requested);
}

#[doc(hidden)]
pub async fn remove_job(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert!(backend.remove_job(job.id).await.unwrap());
    assert!(!backend.remove_job(job.id).await.unwrap());
    assert!(backend.get_job(job.id).await.is_none());
}

#[doc(hidden)]
pub async fn query(backend: impl BackendTesting) {
    let job = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let _ = backend
        .enqueue(EnqueuableJob::mock_job().with_topic("org/apache/sling/other"))
        .await
        .unwrap();
    let _ = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_eq!(
        backend
            .query(Query::IdEquals(42.into()))
            .await
            .unwrap()
            .len(),
        0
    );
    assert_eq!(
        backend.query(Query::IdEquals(job.id)).await.unwrap().len(),
        1
    );
    assert_eq!(
        backend
            .query(Query::TopicEquals(EnqueuableJob::DEFAULT_TOPIC.to_owned()))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(backend.query(Query::all()).await.unwrap().len(), 3);
}
