//! The purpose of this module is to alleviate the need to import many of the `[sling_jobs]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use sling_jobs::prelude::*;
//! ```
pub use async_trait::async_trait;

pub use crate::config::{JobsConfig, QueueConfig, QueueType};
pub use crate::context::JobExecutionContext;
pub use crate::distribution::{
    provider::{DistributionQueueProcessor, SimpleDistributionQueueProvider},
    DistributionQueue, DistributionQueueEntry, DistributionQueueItem,
};
pub use crate::executor::{AsyncCompletion, ConsumerResult, JobConsumer, JobExecutor, JobStatus};
pub use crate::job::result::JobExecutionResult;
pub use crate::job::{Job, JobId, JobState, Properties};
pub use crate::scheduling::{JobScheduler, ScheduleInfo, ScheduledJobInfo};
pub use crate::{JobManager, JobsError};
