use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{info::ScheduleInfo, scheduled_job::ScheduledJobInfo, JobScheduler, SchedulingError};
use crate::job::Properties;

/// Collects the rules of a scheduled job.
///
/// Every rule method appends, so one scheduled job can fire on several rules:
///
/// ```
/// # use sling_jobs::{backend::memory::InMemoryBackend, config::JobsConfig, JobManager};
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let manager = JobManager::new(InMemoryBackend::new().paused(), JobsConfig::default()).unwrap();
/// let scheduled = manager
///     .create_job("org/apache/sling/jobs/report")
///     .schedule("nightly-report")
///     .daily(2, 30)
///     .weekly(1, 12, 0)
///     .add()
///     .unwrap();
/// assert_eq!(scheduled.schedules().len(), 2);
/// # });
/// ```
#[must_use]
pub struct JobScheduleBuilder {
    scheduler: JobScheduler,
    topic: String,
    properties: Properties,
    name: String,
    suspended: bool,
    schedules: Vec<ScheduleInfo>,
}

impl JobScheduleBuilder {
    pub(crate) fn new(
        scheduler: JobScheduler,
        topic: String,
        properties: Properties,
        name: String,
    ) -> Self {
        Self {
            scheduler,
            topic,
            properties,
            name,
            suspended: false,
            schedules: Vec::new(),
        }
    }

    pub fn hourly(self, minute: u32) -> Self {
        self.with(ScheduleInfo::Hourly { minute })
    }

    pub fn daily(self, hour: u32, minute: u32) -> Self {
        self.with(ScheduleInfo::Daily { hour, minute })
    }

    /// `day_of_week` counts from `1` (Sunday) to `7` (Saturday).
    pub fn weekly(self, day_of_week: u32, hour: u32, minute: u32) -> Self {
        self.with(ScheduleInfo::Weekly {
            day_of_week,
            hour,
            minute,
        })
    }

    pub fn monthly(self, day_of_month: u32, hour: u32, minute: u32) -> Self {
        self.with(ScheduleInfo::Monthly {
            day_of_month,
            hour,
            minute,
        })
    }

    pub fn yearly(self, month: u32, day_of_month: u32, hour: u32, minute: u32) -> Self {
        self.with(ScheduleInfo::Yearly {
            month,
            day_of_month,
            hour,
            minute,
        })
    }

    /// Fires once at `date`.
    pub fn at(self, date: DateTime<Utc>) -> Self {
        self.with(ScheduleInfo::Date(date))
    }

    pub fn cron(self, expression: impl Into<String>) -> Self {
        self.with(ScheduleInfo::Cron(expression.into()))
    }

    /// The scheduled job is created suspended.
    pub fn suspend(self) -> Self {
        Self {
            suspended: true,
            ..self
        }
    }

    pub fn add(self) -> Result<Arc<ScheduledJobInfo>, SchedulingError> {
        let mut errors = Vec::new();
        self.add_with_errors(&mut errors)
            .ok_or(SchedulingError::Invalid(errors))
    }

    /// Validation problems are appended to `errors` instead of being returned.
    pub fn add_with_errors(self, errors: &mut Vec<String>) -> Option<Arc<ScheduledJobInfo>> {
        self.scheduler.add_scheduled_job(
            self.topic,
            self.properties,
            self.name,
            self.suspended,
            self.schedules,
            errors,
        )
    }

    fn with(self, schedule: ScheduleInfo) -> Self {
        let mut schedules = self.schedules;
        schedules.push(schedule);
        Self { schedules, ..self }
    }
}
