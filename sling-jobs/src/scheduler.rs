//! A small in process scheduler running named tasks on cron, one shot, or periodic triggers.
//!
//! Every registration runs on its own tokio task until it is unscheduled. Each fire runs the
//! [`executor::ScheduledTask`] on a fresh task, so fires of a slow task can overlap unless the
//! registration forbids concurrent runs, in which case overlapping fires are skipped.
use std::{
    ops::Sub,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use self::executor::{ScheduledTask, TaskExecutor};

pub mod executor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("System in bad state")]
    BadState,
    #[error("Invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },
    #[error("A periodic trigger needs a period greater than zero")]
    InvalidPeriod,
    #[error("Scheduling requires a running tokio runtime")]
    NotInRuntime,
}

#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(cron::Schedule),
    /// Fires once.
    At(DateTime<Utc>),
    /// Fires straight away and then every period.
    Periodic(Duration),
}

impl Trigger {
    /// Parses a six or seven field cron expression, seconds first.
    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        cron::Schedule::from_str(expression)
            .map(Self::Cron)
            .map_err(|err| SchedulerError::InvalidCron {
                expression: expression.to_owned(),
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub name: String,
    pub trigger: Trigger,
    pub can_run_concurrently: bool,
}

impl ScheduleOptions {
    pub fn new(name: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            name: name.into(),
            trigger,
            can_run_concurrently: true,
        }
    }

    pub fn can_run_concurrently(self, can_run_concurrently: bool) -> Self {
        Self {
            can_run_concurrently,
            ..self
        }
    }
}

#[derive(Debug)]
struct Registration {
    generation: u64,
    cancellation_token: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    registrations: Arc<RwLock<FxHashMap<String, Registration>>>,
    generation: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `options.name`, replacing any registration with the same name.
    pub fn schedule(
        &self,
        options: ScheduleOptions,
        task: Arc<dyn ScheduledTask>,
    ) -> Result<(), SchedulerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NotInRuntime)?;
        if matches!(options.trigger, Trigger::Periodic(period) if period.is_zero()) {
            return Err(SchedulerError::InvalidPeriod);
        }

        let ScheduleOptions {
            name,
            trigger,
            can_run_concurrently,
        } = options;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancellation_token = CancellationToken::new();
        {
            let mut registrations = self
                .registrations
                .write()
                .map_err(|_| SchedulerError::BadState)?;
            if let Some(previous) = registrations.insert(
                name.clone(),
                Registration {
                    generation,
                    cancellation_token: cancellation_token.clone(),
                },
            ) {
                previous.cancellation_token.cancel();
            }
        }

        tracing::debug!(%name, ?trigger, "Scheduling {name}");
        let executor = Arc::new(TaskExecutor::new(name.clone(), task, can_run_concurrently));
        let scheduler = self.clone();
        runtime.spawn(
            async move {
                run(trigger, executor, cancellation_token).await;
                scheduler.remove_finished(&name, generation);
            }
            .in_current_span(),
        );
        Ok(())
    }

    /// Returns whether a registration named `name` existed.
    pub fn unschedule(&self, name: &str) -> Result<bool, SchedulerError> {
        let removed = self
            .registrations
            .write()
            .map_err(|_| SchedulerError::BadState)?
            .remove(name);
        Ok(match removed {
            Some(registration) => {
                registration.cancellation_token.cancel();
                tracing::debug!(%name, "Unscheduled {name}");
                true
            }
            None => false,
        })
    }

    pub fn is_scheduled(&self, name: &str) -> Result<bool, SchedulerError> {
        Ok(self
            .registrations
            .read()
            .map_err(|_| SchedulerError::BadState)?
            .contains_key(name))
    }

    /// Stops every registration. Runs already in progress are not interrupted.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        self.registrations
            .write()
            .map_err(|_| SchedulerError::BadState)?
            .drain()
            .for_each(|(_, registration)| registration.cancellation_token.cancel());
        Ok(())
    }

    fn remove_finished(&self, name: &str, generation: u64) {
        if let Ok(mut registrations) = self.registrations.write() {
            if registrations
                .get(name)
                .is_some_and(|registration| registration.generation == generation)
            {
                registrations.remove(name);
            }
        }
    }
}

async fn run(trigger: Trigger, executor: Arc<TaskExecutor>, cancellation_token: CancellationToken) {
    match trigger {
        Trigger::Periodic(period) => {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => fire(&executor, Utc::now()),
                    _ = cancellation_token.cancelled() => break,
                }
            }
        }
        Trigger::At(at) => {
            let delay = at.sub(Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => fire(&executor, at),
                _ = cancellation_token.cancelled() => {},
            }
        }
        Trigger::Cron(schedule) => loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::debug!("No future fire time for cron trigger");
                break;
            };
            let delay = next
                .sub(Utc::now())
                .sub(TimeDelta::milliseconds(10))
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    fire(&executor, next);
                    let delay = next - Utc::now();
                    if delay > TimeDelta::zero() {
                        tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                    }
                }
                _ = cancellation_token.cancelled() => break,
            }
        },
    }
}

fn fire(executor: &Arc<TaskExecutor>, fired_at: DateTime<Utc>) {
    let executor = executor.clone();
    tokio::spawn(
        async move {
            executor.execute(fired_at).await;
        }
        .in_current_span(),
    );
}
