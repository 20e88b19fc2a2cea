use std::sync::{
    atomic::{AtomicBool, Ordering},
    PoisonError, RwLock, Weak,
};

use chrono::{DateTime, Utc};

use super::{builder::JobScheduleBuilder, info::ScheduleInfo, Inner, JobScheduler, SchedulingError};
use crate::job::Properties;

/// A named, recurring job registered with the [`JobScheduler`].
///
/// Every rule in [`ScheduledJobInfo::schedules`] fires independently and each fire adds one job
/// with the stored topic and properties.
#[derive(Debug)]
pub struct ScheduledJobInfo {
    name: String,
    topic: String,
    properties: Properties,
    schedules: RwLock<Vec<ScheduleInfo>>,
    suspended: AtomicBool,
    scheduler: Weak<Inner>,
}

impl ScheduledJobInfo {
    pub(super) fn new(
        name: String,
        topic: String,
        properties: Properties,
        schedules: Vec<ScheduleInfo>,
        suspended: bool,
        scheduler: Weak<Inner>,
    ) -> Self {
        Self {
            name,
            topic,
            properties,
            schedules: RwLock::new(schedules),
            suspended: AtomicBool::new(suspended),
            scheduler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn schedules(&self) -> Vec<ScheduleInfo> {
        self.schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// The earliest next fire over all rules.
    pub fn next_scheduled_execution(&self) -> Option<DateTime<Utc>> {
        self.schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(ScheduleInfo::next_scheduled_execution)
            .min()
    }

    /// Stops the triggers. Only the call that actually suspends touches the scheduler.
    pub fn suspend(&self) -> Result<(), SchedulingError> {
        if self
            .suspended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.scheduler()?.set_suspended(self, true)?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SchedulingError> {
        if self
            .suspended
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.scheduler()?.set_suspended(self, false)?;
        }
        Ok(())
    }

    /// Removes the scheduled job, no more jobs are added for it.
    pub fn unschedule(&self) -> Result<(), SchedulingError> {
        self.scheduler()?.remove_job(self)
    }

    /// A builder pre-filled with this job's name, topic and properties. Adding it replaces
    /// this scheduled job.
    pub fn reschedule(&self) -> Result<JobScheduleBuilder, SchedulingError> {
        let builder = JobScheduleBuilder::new(
            self.scheduler()?,
            self.topic.clone(),
            self.properties.clone(),
            self.name.clone(),
        );
        Ok(if self.is_suspended() {
            builder.suspend()
        } else {
            builder
        })
    }

    pub(super) fn update(&self, schedules: Vec<ScheduleInfo>) {
        *self
            .schedules
            .write()
            .unwrap_or_else(PoisonError::into_inner) = schedules;
    }

    fn scheduler(&self) -> Result<JobScheduler, SchedulingError> {
        self.scheduler
            .upgrade()
            .map(|inner| JobScheduler { inner })
            .ok_or(SchedulingError::SchedulerGone)
    }
}
