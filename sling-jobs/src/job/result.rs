//! The outcome of processing a job.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ResultState {
    Succeeded,
    Cancelled,
    Failed,
}

/// An immutable snapshot of how processing a job ended.
///
/// The three outcomes are mutually exclusive. Use [`JobExecutionResult::SUCCEEDED`],
/// [`JobExecutionResult::FAILED`], and [`JobExecutionResult::CANCELLED`] when there is nothing
/// else to report, otherwise construct one through a [`ResultBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecutionResult {
    state: ResultState,
    message: Option<String>,
    retry_delay: Option<Duration>,
}

impl JobExecutionResult {
    pub const SUCCEEDED: Self = Self::new(ResultState::Succeeded);
    pub const CANCELLED: Self = Self::new(ResultState::Cancelled);
    pub const FAILED: Self = Self::new(ResultState::Failed);

    const fn new(state: ResultState) -> Self {
        Self {
            state,
            message: None,
            retry_delay: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == ResultState::Succeeded
    }

    /// The job was cancelled and should not be retried.
    pub fn cancelled(&self) -> bool {
        self.state == ResultState::Cancelled
    }

    /// The job failed and may be retried.
    pub fn failed(&self) -> bool {
        self.state == ResultState::Failed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Overrides the queue's retry delay for the next attempt.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }
}

/// Builds a [`JobExecutionResult`] carrying a message and/or a retry delay.
///
/// The finishing methods do not consume the builder, each call produces an independent result
/// sharing whatever has been set so far.
///
/// ```
/// # use sling_jobs::job::result::ResultBuilder;
/// let builder = ResultBuilder::default().message("remote system unavailable");
///
/// let failed = builder.failed();
/// let succeeded = builder.succeeded();
///
/// assert!(failed.failed());
/// assert!(succeeded.succeeded());
/// assert_eq!(failed.message(), succeeded.message());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ResultBuilder {
    message: Option<String>,
    retry_delay: Option<Duration>,
}

impl ResultBuilder {
    pub fn message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn succeeded(&self) -> JobExecutionResult {
        self.build(ResultState::Succeeded)
    }

    pub fn cancelled(&self) -> JobExecutionResult {
        self.build(ResultState::Cancelled)
    }

    pub fn failed(&self) -> JobExecutionResult {
        self.build(ResultState::Failed)
    }

    /// Fails the job asking for the next attempt to happen after `retry_delay`.
    ///
    /// The delay is remembered by the builder and carried by results built afterwards.
    pub fn failed_with_delay(&mut self, retry_delay: Duration) -> JobExecutionResult {
        self.retry_delay = Some(retry_delay);
        self.build(ResultState::Failed)
    }

    fn build(&self, state: ResultState) -> JobExecutionResult {
        JobExecutionResult {
            state,
            message: self.message.clone(),
            retry_delay: self.retry_delay,
        }
    }
}
