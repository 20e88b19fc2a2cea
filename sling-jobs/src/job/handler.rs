use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use chrono::Utc;

use crate::backend::Backend;

use super::{Job, JobId, JobUpdate};

/// The runtime's handle on a single active job.
///
/// Every write an executor makes through its context ends up here, where it is applied to the
/// local snapshot and persisted through the backend.
pub(crate) struct JobHandler {
    job_id: JobId,
    job: RwLock<Job>,
    backend: Arc<dyn Backend>,
    stopped: AtomicBool,
}

impl JobHandler {
    pub(crate) fn new(job: Job, backend: Arc<dyn Backend>) -> Self {
        Self {
            job_id: job.id,
            stopped: AtomicBool::new(job.stop_requested),
            job: RwLock::new(job),
            backend,
        }
    }

    pub(crate) fn job_id(&self) -> JobId {
        self.job_id
    }

    /// The job as seen by this handler, including updates persisted so far.
    pub(crate) fn job(&self) -> Option<Job> {
        self.job.read().ok().map(|job| job.clone())
    }

    pub(crate) async fn persist(&self, update: JobUpdate) {
        let job_id = self.job_id;
        if let Ok(mut job) = self.job.write() {
            job.apply(&update, Utc::now());
        }
        let _ = self
            .backend
            .apply_update(job_id, update)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to persist update for job {job_id}, error: {err:?}",
                )
            });
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use crate::backend::{test::MockStore, BackendError};

    use super::*;

    #[tokio::test]
    async fn persist_updates_snapshot_and_backend() {
        let mut backend = MockStore::new();
        backend
            .expect_apply_update()
            .withf(|id, update| {
                *id == JobId::from(0) && *update == JobUpdate::Log("hello".to_owned())
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = JobHandler::new(Job::raw_job(), Arc::new(backend));
        handler.persist(JobUpdate::Log("hello".to_owned())).await;

        assert_eq!(handler.job().unwrap().log, vec!["hello"]);
    }

    #[tokio::test]
    async fn persist_failure_is_swallowed() {
        let mut backend = MockStore::new();
        backend
            .expect_apply_update()
            .times(1)
            .returning(|id, _| Err(BackendError::JobNotFound(id)));

        let handler = JobHandler::new(Job::raw_job(), Arc::new(backend));
        handler
            .persist(JobUpdate::ResultMessage("done".to_owned()))
            .await;

        assert_eq!(
            handler.job().unwrap().result_message.as_deref(),
            Some("done")
        );
    }

    #[test]
    fn stop_flag() {
        let handler = JobHandler::new(Job::raw_job(), Arc::new(MockStore::new()));
        assert!(!handler.is_stopped());
        handler.stop();
        assert!(handler.is_stopped());

        let job = Job {
            stop_requested: true,
            ..Job::raw_job()
        };
        let handler = JobHandler::new(job, Arc::new(MockStore::new()));
        assert!(handler.is_stopped());
    }
}
