//! The job model.
//!
//! A [`Job`] is one unit of asynchronous work addressed to a topic. Jobs are created through
//! [`crate::JobManager::add_job`] (or [`builder::JobBuilder`]), handed to the matching
//! [`crate::executor::JobExecutor`] by the queue runtime, and moved through the
//! [`JobState`] machine until they reach a final state.
use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;
pub(crate) mod handler;
pub mod result;
pub(crate) mod runner;

/// The opaque property bag carried by every job.
pub type Properties = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct JobId(u64);

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The lifecycle state of a job.
///
/// ```text
/// Queued ──► Active ──► Succeeded | Failed | Error | Stopped | Dropped
///   ▲          │
///   └──────────┘ (failed attempt with retries left)
/// ```
///
/// A queued job can also be stopped or dropped before it ever becomes active.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting for a free slot in its queue, either new or waiting for a retry.
    Queued,
    /// Currently being processed by an executor.
    Active,
    /// Processed successfully.
    Succeeded,
    /// Failed on every attempt and ran out of retries.
    Failed,
    /// Cancelled by the executor without a stop request. Not retried.
    Error,
    /// Cancelled after an operator asked the job to stop.
    Stopped,
    /// Discarded without processing, e.g. because no executor handles its topic.
    Dropped,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        Self::Queued,
        Self::Active,
        Self::Succeeded,
        Self::Failed,
        Self::Error,
        Self::Stopped,
        Self::Dropped,
    ];

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Queued | Self::Active)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Final states never transition again.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Active | Self::Stopped | Self::Dropped) => true,
            (Self::Active, Self::Active) => false,
            (Self::Active, _) => true,
            _ => false,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "QUEUED",
            Self::Active => "ACTIVE",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
            Self::Dropped => "DROPPED",
        };
        f.write_str(name)
    }
}

/// Progress information reported by an executor through
/// [`crate::context::JobExecutionContext::init_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub total_steps: u32,
    pub finished_steps: u32,
    pub eta: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// The hierarchical topic, e.g. `org/apache/sling/jobs/foo`. Never changes after creation.
    pub topic: String,
    pub queue_name: String,
    pub properties: Properties,
    pub state: JobState,
    pub retry_count: u32,
    /// The maximum number of retries, [`None`] meaning the job is retried forever.
    pub max_retries: Option<u32>,
    pub created: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub progress: Option<Progress>,
    pub log: Vec<String>,
    pub result_message: Option<String>,
    pub stop_requested: bool,
}

impl Job {
    /// Applies a persisted update to this job.
    ///
    /// This is the only way job data changes while it is being processed; both the
    /// [`handler::JobHandler`] snapshot and the backends go through it.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        match update {
            JobUpdate::StartProgress { steps, eta } => {
                self.progress = Some(Progress {
                    total_steps: *steps,
                    finished_steps: 0,
                    eta: eta.map(|eta| eta_from(now, eta)),
                });
            }
            JobUpdate::ProgressCount(steps) => {
                if let Some(progress) = self.progress.as_mut() {
                    progress.finished_steps = progress
                        .finished_steps
                        .saturating_add(*steps)
                        .min(progress.total_steps);
                }
            }
            JobUpdate::Eta(eta) => {
                if let Some(progress) = self.progress.as_mut() {
                    progress.eta = Some(eta_from(now, *eta));
                }
            }
            JobUpdate::Log(message) => self.log.push(message.clone()),
            JobUpdate::ResultMessage(message) => self.result_message = Some(message.clone()),
        }
    }
}

/// Estimates far in the future saturate instead of overflowing.
fn eta_from(now: DateTime<Utc>, eta: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(eta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A single write to a job's persisted data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    StartProgress {
        steps: u32,
        eta: Option<TimeDelta>,
    },
    ProgressCount(u32),
    Eta(TimeDelta),
    Log(String),
    ResultMessage(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Discarding job with invalid topic: {0:?}")]
pub struct InvalidTopic(pub String);

/// Checks that `topic` is a usable job topic.
///
/// Topics are `/` separated segments of `[A-Za-z0-9_.-]`. Wildcards are only valid when
/// registering executors, never on a job.
pub fn check_topic(topic: &str) -> Result<(), InvalidTopic> {
    let valid = !topic.is_empty()
        && topic.split('/').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        });
    if valid {
        Ok(())
    } else {
        Err(InvalidTopic(topic.to_owned()))
    }
}
