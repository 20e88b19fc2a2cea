//! Ordered queues of distribution work items.
//!
//! A [`DistributionQueue`] hands out its head item until the item is removed, tracking for
//! every item when it entered the queue and how often it was looked at. The queue state is
//! derived from the head alone: a head that failed to enter or was already looked at more than
//! once blocks the queue.
//!
//! [`simple::SimpleDistributionQueue`] is the in memory implementation, its content is lost on
//! restart. [`provider::SimpleDistributionQueueProvider`] creates queues by name and drains them
//! periodically.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{job::Properties, scheduler::SchedulerError};

pub mod provider;
pub mod simple;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistributionQueueError {
    #[error("System in bad state")]
    BadState,
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionQueueItem {
    pub id: String,
    pub properties: Properties,
}

impl DistributionQueueItem {
    pub fn new(id: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Queued,
    /// The item could not be added.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionQueueItemStatus {
    pub state: ItemState,
    /// How often the item was returned as the queue head.
    pub attempts: u32,
    pub entered: DateTime<Utc>,
    pub queue_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionQueueEntry {
    pub id: String,
    pub item: DistributionQueueItem,
    pub status: DistributionQueueItemStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionQueueState {
    Idle,
    Running,
    Blocked,
}

#[async_trait]
pub trait DistributionQueue: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when the item could not be added, for example because the queue stayed full.
    /// The caller decides whether to try again.
    async fn add(
        &self,
        item: DistributionQueueItem,
    ) -> Result<Option<DistributionQueueEntry>, DistributionQueueError>;

    /// The first item, without removing it. Every call counts as an attempt for that item.
    async fn get_head(&self) -> Result<Option<DistributionQueueEntry>, DistributionQueueError>;

    async fn get_item(
        &self,
        id: &str,
    ) -> Result<Option<DistributionQueueEntry>, DistributionQueueError>;

    async fn remove(
        &self,
        id: &str,
    ) -> Result<Option<DistributionQueueEntry>, DistributionQueueError>;

    /// Items in queue order, skipping `skip` and returning at most `limit` when given.
    async fn get_items(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<DistributionQueueEntry>, DistributionQueueError>;

    /// Also known for items that failed to be added.
    async fn get_status(
        &self,
        id: &str,
    ) -> Result<Option<DistributionQueueItemStatus>, DistributionQueueError>;

    async fn get_state(&self) -> Result<DistributionQueueState, DistributionQueueError>;

    async fn len(&self) -> Result<usize, DistributionQueueError>;

    async fn is_empty(&self) -> Result<bool, DistributionQueueError> {
        Ok(self.len().await? == 0)
    }
}
