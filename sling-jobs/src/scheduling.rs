//! Recurring jobs.
//!
//! A [`JobScheduler`] keeps named [`ScheduledJobInfo`]s, each binding a job topic and properties
//! to one or more [`ScheduleInfo`] rules. Every rule is registered with the [`Scheduler`] as its
//! own non-concurrent trigger named `{name}-{index}`, and every fire adds one job. One time rules
//! are dropped once they fired, a scheduled job whose last rule is dropped is removed.
//!
//! Triggers only run while the scheduler is active, see [`JobScheduler::set_active`].
use std::{
    cmp::Ordering as CmpOrdering,
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{
    job::{check_topic, Job, Properties},
    scheduler::{
        executor::{JobContext, ScheduledTask, TaskError},
        ScheduleOptions, Scheduler, SchedulerError,
    },
    JobsError,
};

pub mod builder;
pub mod info;
pub mod scheduled_job;

pub use builder::JobScheduleBuilder;
pub use info::{ScheduleInfo, ScheduleType};
pub use scheduled_job::ScheduledJobInfo;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("System in bad state")]
    BadState,
    #[error("Invalid scheduled job: {}", .0.join(", "))]
    Invalid(Vec<String>),
    #[error("The job scheduler has been dropped")]
    SchedulerGone,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Adds the jobs of fired schedules.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait JobAdder: Send + Sync {
    async fn add_job(&self, topic: &str, properties: Properties) -> Result<Job, JobsError>;
}

#[derive(Clone, Debug)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    scheduler: Scheduler,
    adder: Arc<dyn JobAdder>,
    active: AtomicBool,
    scheduled_jobs: RwLock<BTreeMap<String, Arc<ScheduledJobInfo>>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub(crate) fn new(scheduler: Scheduler, adder: Arc<dyn JobAdder>, active: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                adder,
                active: AtomicBool::new(active),
                scheduled_jobs: Default::default(),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Starts or stops the triggers of every scheduled job that is not suspended.
    ///
    /// Only one process in a group sharing scheduled jobs should be active.
    pub fn set_active(&self, active: bool) -> Result<(), SchedulingError> {
        let changed = self
            .inner
            .active
            .compare_exchange(!active, active, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !changed {
            return Ok(());
        }
        tracing::debug!(active, "Job scheduler active: {active}");
        for info in self.all()? {
            if active {
                self.start_scheduled_job(&info)?;
            } else {
                self.unschedule_triggers(&info, info.schedules().len())?;
            }
        }
        Ok(())
    }

    pub fn scheduled_job(&self, name: &str) -> Result<Option<Arc<ScheduledJobInfo>>, SchedulingError> {
        Ok(self
            .inner
            .scheduled_jobs
            .read()
            .map_err(|_| SchedulingError::BadState)?
            .get(name)
            .cloned())
    }

    /// Scheduled jobs ordered by name.
    ///
    /// `topic` restricts the result to one job topic and a `limit` of `0` means no limit. When
    /// `templates` are given a scheduled job has to match at least one of them. A template key
    /// is a property name, optionally prefixed by one of `=`, `<`, `<=`, `>`, `>=`, comparing the
    /// job's property with the template value. Ordering comparisons only match numbers and
    /// strings.
    pub fn get_scheduled_jobs(
        &self,
        topic: Option<&str>,
        limit: usize,
        templates: &[Properties],
    ) -> Result<Vec<Arc<ScheduledJobInfo>>, SchedulingError> {
        let jobs = self
            .inner
            .scheduled_jobs
            .read()
            .map_err(|_| SchedulingError::BadState)?;
        let matching = jobs
            .values()
            .filter(|info| topic.map_or(true, |topic| info.topic() == topic))
            .filter(|info| {
                templates.is_empty()
                    || templates
                        .iter()
                        .any(|template| matches_template(info.properties(), template))
            })
            .cloned();
        Ok(match limit {
            0 => matching.collect(),
            limit => matching.take(limit).collect(),
        })
    }

    pub(crate) fn builder(
        &self,
        topic: String,
        properties: Properties,
        name: String,
    ) -> JobScheduleBuilder {
        JobScheduleBuilder::new(self.clone(), topic, properties, name)
    }

    /// Stops every trigger without touching the stored scheduled jobs.
    pub(crate) fn shutdown(&self) -> Result<(), SchedulingError> {
        self.inner.active.store(false, Ordering::SeqCst);
        Ok(self.inner.scheduler.shutdown()?)
    }

    fn add_scheduled_job(
        &self,
        topic: String,
        properties: Properties,
        name: String,
        suspended: bool,
        schedules: Vec<ScheduleInfo>,
        errors: &mut Vec<String>,
    ) -> Option<Arc<ScheduledJobInfo>> {
        let mut messages = Vec::new();
        if name.is_empty() {
            messages.push("Schedule name not specified".to_owned());
        }
        if let Err(err) = check_topic(&topic) {
            messages.push(err.to_string());
        }
        if schedules.is_empty() {
            messages.push(format!("No schedule defined for {name}"));
        }
        schedules
            .iter()
            .for_each(|schedule| schedule.check(&mut messages));

        if messages.is_empty() {
            let info = Arc::new(ScheduledJobInfo::new(
                name,
                topic,
                properties,
                schedules,
                suspended,
                Arc::downgrade(&self.inner),
            ));
            match self.add_or_update(info.clone()) {
                Ok(()) => return Some(info),
                Err(err) => {
                    tracing::error!(?err, name = info.name(), "Unable to schedule job: {err}");
                    messages.push(format!("Unable to schedule job {}: {err}", info.name()));
                }
            }
        } else {
            messages.iter().for_each(|message| tracing::warn!("{message}"));
        }
        errors.extend(messages);
        None
    }

    fn add_or_update(&self, info: Arc<ScheduledJobInfo>) -> Result<(), SchedulingError> {
        let previous = self
            .inner
            .scheduled_jobs
            .write()
            .map_err(|_| SchedulingError::BadState)?
            .insert(info.name().to_owned(), info.clone());
        if let Some(previous) = previous {
            self.stop_scheduled_job(&previous)?;
        }
        self.start_scheduled_job(&info).inspect_err(|_| {
            let _ = self.remove_job(&info);
        })
    }

    /// Replaced scheduled jobs are left alone, their trigger names belong to the replacement.
    fn remove_job(&self, info: &ScheduledJobInfo) -> Result<(), SchedulingError> {
        let removed = {
            let mut jobs = self
                .inner
                .scheduled_jobs
                .write()
                .map_err(|_| SchedulingError::BadState)?;
            match jobs.get(info.name()) {
                Some(stored) if std::ptr::eq(Arc::as_ptr(stored), info) => jobs.remove(info.name()),
                _ => None,
            }
        };
        if removed.is_some() {
            self.stop_scheduled_job(info)?;
        }
        Ok(())
    }

    fn set_suspended(&self, info: &ScheduledJobInfo, suspended: bool) -> Result<(), SchedulingError> {
        if !self.is_current(info)? {
            return Ok(());
        }
        if suspended {
            self.stop_scheduled_job(info)
        } else {
            self.start_scheduled_job(info)
        }
    }

    fn is_current(&self, info: &ScheduledJobInfo) -> Result<bool, SchedulingError> {
        Ok(self
            .scheduled_job(info.name())?
            .is_some_and(|stored| std::ptr::eq(Arc::as_ptr(&stored), info)))
    }

    fn start_scheduled_job(&self, info: &ScheduledJobInfo) -> Result<(), SchedulingError> {
        if !self.is_active() {
            return Ok(());
        }
        let (name, topic, properties) = (info.name(), info.topic(), info.properties());
        let schedules = info.schedules();
        if info.is_suspended() {
            tracing::debug!(%name, %topic, ?properties, ?schedules, "SCHEDULED SUSPENDED {name}");
            return Ok(());
        }
        tracing::debug!(%name, %topic, ?properties, ?schedules, "SCHEDULED OK {name}");
        for (index, schedule) in schedules.iter().enumerate() {
            let options = ScheduleOptions::new(trigger_name(name, index), schedule.trigger()?)
                .can_run_concurrently(false);
            self.inner.scheduler.schedule(
                options,
                Arc::new(Fire {
                    scheduler: Arc::downgrade(&self.inner),
                    name: name.to_owned(),
                    index,
                }),
            )?;
        }
        Ok(())
    }

    fn stop_scheduled_job(&self, info: &ScheduledJobInfo) -> Result<(), SchedulingError> {
        if !self.is_active() {
            return Ok(());
        }
        let (name, topic, properties) = (info.name(), info.topic(), info.properties());
        tracing::debug!(%name, %topic, ?properties, "SCHEDULED STOP {name}");
        self.unschedule_triggers(info, info.schedules().len())
    }

    fn unschedule_triggers(
        &self,
        info: &ScheduledJobInfo,
        count: usize,
    ) -> Result<(), SchedulingError> {
        for index in 0..count {
            self.inner
                .scheduler
                .unschedule(&trigger_name(info.name(), index))?;
        }
        Ok(())
    }

    async fn fire(&self, name: &str, index: usize) -> Result<(), SchedulingError> {
        let Some(info) = self.scheduled_job(name)? else {
            return Ok(());
        };
        if info.is_suspended() {
            return Ok(());
        }

        let _ = self
            .inner
            .adder
            .add_job(info.topic(), info.properties().clone())
            .await
            .inspect_err(|err| {
                tracing::error!(?err, %name, "Failed to add job for schedule {name}: {err}")
            });

        let mut schedules = info.schedules();
        if schedules.get(index).map(ScheduleInfo::kind) == Some(ScheduleType::Date) {
            if schedules.len() == 1 {
                self.remove_job(&info)?;
            } else {
                // Removing the rule shifts the indices of the ones after it.
                self.stop_scheduled_job(&info)?;
                schedules.remove(index);
                info.update(schedules);
                self.start_scheduled_job(&info)?;
            }
        }
        Ok(())
    }

    fn all(&self) -> Result<Vec<Arc<ScheduledJobInfo>>, SchedulingError> {
        Ok(self
            .inner
            .scheduled_jobs
            .read()
            .map_err(|_| SchedulingError::BadState)?
            .values()
            .cloned()
            .collect())
    }
}

fn trigger_name(name: &str, index: usize) -> String {
    format!("{name}-{index}")
}

struct Fire {
    scheduler: Weak<Inner>,
    name: String,
    index: usize,
}

#[async_trait]
impl ScheduledTask for Fire {
    async fn execute(&self, _context: JobContext) -> Result<(), TaskError> {
        match self.scheduler.upgrade() {
            Some(inner) => Ok(JobScheduler { inner }
                .fire(&self.name, self.index)
                .await?),
            None => Ok(()),
        }
    }
}

fn matches_template(properties: &Properties, template: &Properties) -> bool {
    template.iter().all(|(key, expected)| {
        let (name, accepts): (&str, fn(CmpOrdering) -> bool) =
            if let Some(name) = key.strip_prefix("<=") {
                (name, CmpOrdering::is_le)
            } else if let Some(name) = key.strip_prefix(">=") {
                (name, CmpOrdering::is_ge)
            } else if let Some(name) = key.strip_prefix('<') {
                (name, CmpOrdering::is_lt)
            } else if let Some(name) = key.strip_prefix('>') {
                (name, CmpOrdering::is_gt)
            } else {
                return properties.get(key.strip_prefix('=').unwrap_or(key)) == Some(expected);
            };
        properties
            .get(name)
            .and_then(|actual| compare(actual, expected))
            .is_some_and(accepts)
    })
}

fn compare(actual: &Value, expected: &Value) -> Option<CmpOrdering> {
    match (actual, expected) {
        (Value::Number(actual), Value::Number(expected)) => {
            actual.as_f64()?.partial_cmp(&expected.as_f64()?)
        }
        (Value::String(actual), Value::String(expected)) => Some(actual.cmp(expected)),
        _ => None,
    }
}
