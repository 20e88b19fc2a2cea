//! Provides an in memory implementation of [`Backend`].
//!
//! Jobs live only as long as the process. It is a correct, not an optimized, implementation and
//! is what the demos and the test suites run against.
use std::{
    collections::HashMap,
    ops::Sub,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use tokio::sync::mpsc;

use super::{queryable::Queryable, Backend, BackendError, EnqueuableJob, Query};
use crate::job::{Job, JobId, JobState, JobUpdate};

struct ReadyJobStream {
    backend: InMemoryBackend,
    queue_name: String,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyJobStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    pub async fn next(&mut self) -> Result<Job, BackendError> {
        loop {
            let delay = match self.backend.next_job_scheduled_at(&self.queue_name)? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                _ => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(job) = self.backend.load_job_mark_as_active(&self.queue_name)? {
                    return Ok(job);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => { },
                _ = tokio::time::sleep(delay) => { },
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

/// An in memory implementation of [`Backend`].
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicU64>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    paused: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the backend in paused mode where streams will not be woken up when jobs are inserted or
    /// updated.
    ///
    /// If you would like to then run jobs later in the test you can call
    /// [`InMemoryBackend::notify_all`].
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up all the stream subscribers to continue execution.
    pub fn notify_all(&self) -> Result<(), BackendError> {
        let scheduled_at = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| BackendError::BadState)?
            .values()
            .flatten()
            .for_each(|sender| {
                let _ = sender.send(scheduled_at);
            });
        Ok(())
    }

    fn next_job_scheduled_at(&self, queue_name: &str) -> Result<Option<DateTime<Utc>>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| job.queue_name == queue_name && job.state == JobState::Queued)
            .map(|job| job.scheduled_at)
            .min())
    }

    fn load_job_mark_as_active(&self, queue_name: &str) -> Result<Option<Job>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let now = Utc::now();
        // Jobs are kept in insertion order so the first due job is the oldest one.
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                job.queue_name == queue_name
                    && job.state == JobState::Queued
                    && job.scheduled_at - now < TimeDelta::milliseconds(100)
            })
            .min_by_key(|job| job.scheduled_at)
            .map(|job| {
                job.state = JobState::Active;
                job.started = Some(now);
                job.clone()
            }))
    }

    fn notify_subscribers(
        &self,
        queue_name: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        if !self.paused.load(Ordering::Relaxed) {
            if let Some(subscribers) = self
                .subscribers
                .read()
                .map_err(|_| BackendError::BadState)?
                .get(queue_name)
            {
                subscribers.iter().for_each(|sender| {
                    let _ = sender.send(scheduled_at);
                });
            }
        }
        Ok(())
    }

    fn with_job<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) => f(job),
        }
    }
}

impl EnqueuableJob {
    pub(super) fn into_job(self, id: u64) -> Job {
        Job {
            id: id.into(),
            topic: self.topic,
            queue_name: self.queue_name,
            properties: self.properties,
            state: JobState::Queued,
            retry_count: 0,
            max_retries: self.max_retries,
            created: Utc::now(),
            scheduled_at: self.scheduled_at,
            started: None,
            finished: None,
            progress: None,
            log: vec![],
            result_message: None,
            stop_requested: false,
        }
    }
}

fn transition(job: &mut Job, to: JobState) -> Result<(), BackendError> {
    if job.state.can_transition_to(to) {
        job.state = to;
        Ok(())
    } else {
        Err(BackendError::InvalidTransition {
            id: job.id,
            from: job.state,
            to,
        })
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe_ready_jobs(
        &self,
        queue_name: String,
    ) -> Pin<Box<dyn Stream<Item = Result<Job, BackendError>> + Send>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.entry(queue_name.clone()).or_default().push(sender),
            Err(_) => return Box::pin(futures::stream::once(async { Err(BackendError::BadState) })),
        }

        let mut stream = ReadyJobStream {
            receiver,
            backend: self.clone(),
            queue_name,
        };
        Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        })
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<Job, BackendError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let job = job.into_job(id);

        self.jobs
            .write()
            .map_err(|_| BackendError::BadState)?
            .push(job.clone());

        self.notify_subscribers(&job.queue_name, job.scheduled_at)?;
        Ok(job)
    }

    async fn load(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn apply_update(&self, id: JobId, update: JobUpdate) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.apply(&update, Utc::now());
            Ok(())
        })
    }

    async fn mark_retry(
        &self,
        id: JobId,
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let queue_name = self.with_job(id, |job| {
            transition(job, JobState::Queued)?;
            job.retry_count = retry_count;
            job.scheduled_at = scheduled_at;
            job.started = None;
            job.progress = None;
            Ok(job.queue_name.clone())
        })?;
        self.notify_subscribers(&queue_name, scheduled_at)
    }

    async fn mark_finished(&self, id: JobId, state: JobState) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            transition(job, state)?;
            job.finished = Some(Utc::now());
            Ok(())
        })
    }

    async fn request_stop(&self, id: JobId) -> Result<JobState, BackendError> {
        self.with_job(id, |job| {
            job.stop_requested = true;
            if job.state == JobState::Queued {
                transition(job, JobState::Stopped)?;
                job.finished = Some(Utc::now());
            }
            Ok(job.state)
        })
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let len = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() != len)
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }
}
