//! The persistence seam for jobs.
//!
//! A [`Backend`] stores jobs and hands ready jobs to the queue runtime. The runtime never writes
//! job data directly, every change goes through one of the methods below so that persistence
//! ordering stays well defined.
//!
//! [`memory::InMemoryBackend`] is the implementation shipped with this crate. Implementors of
//! other backends can run the shared conformance suite via [`crate::test_suite`].
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use thiserror::Error;

use crate::job::{Job, JobId, JobState, JobUpdate, Properties};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait Backend: Send + Sync {
    /// A never ending stream of jobs for `queue_name` that are due, each already marked
    /// [`JobState::Active`].
    ///
    /// When several streams are subscribed to the same queue each job is delivered to exactly
    /// one of them.
    async fn subscribe_ready_jobs(
        &self,
        queue_name: String,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>>;
    async fn enqueue(&self, job: EnqueuableJob) -> Result<Job, BackendError>;
    async fn load(&self, id: JobId) -> Result<Option<Job>, BackendError>;
    /// Atomically applies `update` to the stored job.
    async fn apply_update(&self, id: JobId, update: JobUpdate) -> Result<(), BackendError>;
    /// Puts an active job back into the queue for another attempt.
    async fn mark_retry(
        &self,
        id: JobId,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;
    async fn mark_finished(&self, id: JobId, state: JobState) -> Result<(), BackendError>;
    /// Records a stop request and returns the job's state afterwards.
    ///
    /// Queued jobs are stopped straight away, active jobs keep running until their executor
    /// notices the request.
    async fn request_stop(&self, id: JobId) -> Result<JobState, BackendError>;
    /// Returns whether a job was removed.
    async fn remove_job(&self, id: JobId) -> Result<bool, BackendError>;
    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub topic: String,
    pub queue_name: String,
    pub properties: Properties,
    pub max_retries: Option<u32>,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
    IdEquals(JobId),
    TopicEquals(String),
    QueueEquals(String),
    StateEqual(JobState),
    PropertyEquals(String, serde_json::Value),
}

impl Query {
    /// Matches every job.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }
}
