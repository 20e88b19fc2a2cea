//! Runs one fire of a scheduled task, guarding against overlapping runs.
use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Passed to a [`ScheduledTask`] on every fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    /// The name the task was scheduled under.
    pub name: String,
    pub fired_at: DateTime<Utc>,
}

/// The work run by the [`super::Scheduler`] whenever a trigger fires.
///
/// Closures of the form `Fn(JobContext) -> impl Future<Output = Result<(), TaskError>>`
/// implement this trait.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn execute(&self, context: JobContext) -> Result<(), TaskError>;
}

#[async_trait]
impl<F, Fut> ScheduledTask for F
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn execute(&self, context: JobContext) -> Result<(), TaskError> {
        (self)(context).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Execution {
    /// The previous run was still going and the task does not allow concurrent runs.
    Skipped,
    Completed,
    /// The task returned an error or panicked.
    Failed,
}

struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct TaskExecutor {
    name: String,
    task: Arc<dyn ScheduledTask>,
    can_run_concurrently: bool,
    is_running: AtomicBool,
}

impl TaskExecutor {
    pub(crate) fn new(
        name: String,
        task: Arc<dyn ScheduledTask>,
        can_run_concurrently: bool,
    ) -> Self {
        Self {
            name,
            task,
            can_run_concurrently,
            is_running: AtomicBool::new(false),
        }
    }

    pub(crate) async fn execute(&self, fired_at: DateTime<Utc>) -> Execution {
        let name = &self.name;
        let _running = if self.can_run_concurrently {
            None
        } else {
            if self
                .is_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                tracing::debug!(%name, "Skipping {name}, previous run still in progress");
                return Execution::Skipped;
            }
            Some(Running(&self.is_running))
        };

        let context = JobContext {
            name: name.clone(),
            fired_at,
        };
        match AssertUnwindSafe(self.task.execute(context))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Execution::Completed,
            Ok(Err(err)) => {
                tracing::error!(?err, %name, "Scheduled task {name} failed with {err}");
                Execution::Failed
            }
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(%name, "Scheduled task {name} panicked: {message}");
                Execution::Failed
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
    {
        Some(message) => message,
        None => "Unknown panic".to_owned(),
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;

    fn counting(
        calls: Arc<AtomicUsize>,
        release: Arc<Notify>,
        panics: bool,
    ) -> Arc<dyn ScheduledTask> {
        Arc::new(move |_context: JobContext| {
            let calls = calls.clone();
            let release = release.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                if panics {
                    panic!("task exploded");
                }
                Ok::<(), TaskError>(())
            }
        })
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped_and_guard_reset_after_panic() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let executor = Arc::new(TaskExecutor::new(
            "overlap".to_owned(),
            counting(calls.clone(), release.clone(), true),
            false,
        ));

        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(Utc::now()).await }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(executor.is_running());

        assert_eq!(executor.execute(Utc::now()).await, Execution::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release.notify_one();
        assert_eq!(first.await.unwrap(), Execution::Failed);
        assert!(!executor.is_running());
    }

    #[tokio::test]
    async fn concurrent_runs_allowed_when_configured() {
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let executor = Arc::new(TaskExecutor::new(
            "concurrent".to_owned(),
            counting(calls.clone(), release.clone(), false),
            true,
        ));

        let runs: Vec<_> = (0..2)
            .map(|_| {
                let executor = executor.clone();
                tokio::spawn(async move { executor.execute(Utc::now()).await })
            })
            .collect();
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        release.notify_waiters();

        for run in runs {
            assert_eq!(run.await.unwrap(), Execution::Completed);
        }
    }

    #[tokio::test]
    async fn task_errors_are_reported() {
        let task: Arc<dyn ScheduledTask> =
            Arc::new(|_context: JobContext| async { Err::<(), TaskError>("nope".into()) });
        let executor = TaskExecutor::new("failing".to_owned(), task, false);

        assert_eq!(executor.execute(Utc::now()).await, Execution::Failed);
        assert!(!executor.is_running());
        assert_eq!(executor.execute(Utc::now()).await, Execution::Failed);
    }
}
