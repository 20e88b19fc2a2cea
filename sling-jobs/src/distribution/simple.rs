use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use fxhash::FxHashMap;
use tokio::sync::Semaphore;

use super::{
    DistributionQueue, DistributionQueueEntry, DistributionQueueError, DistributionQueueItem,
    DistributionQueueItemStatus, DistributionQueueState, ItemState,
};
use crate::config::DistributionConfig;

type Result<T> = std::result::Result<T, DistributionQueueError>;

/// A bounded in memory FIFO queue.
///
/// Statuses are kept in a side table keyed by item id and dropped when the item is removed.
/// Looking at the head and counting the attempt are two steps, so concurrent callers of
/// [`DistributionQueue::get_head`] each count an attempt for the same head.
#[derive(Debug)]
pub struct SimpleDistributionQueue {
    name: String,
    items: Mutex<VecDeque<DistributionQueueItem>>,
    statuses: Mutex<FxHashMap<String, DistributionQueueItemStatus>>,
    capacity: Arc<Semaphore>,
    add_timeout: Duration,
}

impl SimpleDistributionQueue {
    pub fn new(name: impl Into<String>, config: &DistributionConfig) -> Self {
        Self {
            name: name.into(),
            items: Default::default(),
            statuses: Default::default(),
            capacity: Arc::new(Semaphore::new(config.capacity)),
            add_timeout: config.add_timeout,
        }
    }

    fn status(&self, id: &str) -> Result<Option<DistributionQueueItemStatus>> {
        Ok(self
            .statuses
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .get(id)
            .cloned())
    }

    fn record(&self, id: &str, state: ItemState) -> Result<DistributionQueueItemStatus> {
        let status = DistributionQueueItemStatus {
            state,
            attempts: 0,
            entered: Utc::now(),
            queue_name: self.name.clone(),
        };
        self.statuses
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .insert(id.to_owned(), status.clone());
        Ok(status)
    }

    fn entry(&self, item: DistributionQueueItem) -> Result<DistributionQueueEntry> {
        let status = match self.status(&item.id)? {
            Some(status) => status,
            None => self.record(&item.id, ItemState::Queued)?,
        };
        Ok(DistributionQueueEntry {
            id: item.id.clone(),
            item,
            status,
        })
    }

    fn contains(&self, id: &str) -> Result<bool> {
        Ok(self
            .items
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .iter()
            .any(|item| item.id == id))
    }

    fn head(&self) -> Result<Option<DistributionQueueItem>> {
        Ok(self
            .items
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .front()
            .cloned())
    }
}

#[async_trait]
impl DistributionQueue for SimpleDistributionQueue {
    fn name(&self) -> &str {
        &self.name
    }

    /// Items whose id is already queued are rejected, the queued item keeps its status.
    async fn add(&self, item: DistributionQueueItem) -> Result<Option<DistributionQueueEntry>> {
        let name = &self.name;
        let id = item.id.clone();
        if self.contains(&id)? {
            tracing::warn!(%name, %id, "Item {id} is already in queue {name}");
            return Ok(None);
        }
        match tokio::time::timeout(self.add_timeout, self.capacity.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => {
                let mut items = self
                    .items
                    .lock()
                    .map_err(|_| DistributionQueueError::BadState)?;
                if items.iter().any(|queued| queued.id == id) {
                    tracing::warn!(%name, %id, "Item {id} is already in queue {name}");
                    return Ok(None);
                }
                // Given back in `remove`.
                permit.forget();
                let status = self.record(&id, ItemState::Queued)?;
                items.push_back(item.clone());
                tracing::debug!(%name, %id, "Added item {id} to queue {name}");
                Ok(Some(DistributionQueueEntry { id, item, status }))
            }
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(
                    %name,
                    %id,
                    "Could not add item {id} to queue {name} within {:?}",
                    self.add_timeout
                );
                if !self.contains(&id)? {
                    self.record(&id, ItemState::Error)?;
                }
                Ok(None)
            }
        }
    }

    async fn get_head(&self) -> Result<Option<DistributionQueueEntry>> {
        let Some(item) = self.head()? else {
            return Ok(None);
        };
        let status = {
            let mut statuses = self
                .statuses
                .lock()
                .map_err(|_| DistributionQueueError::BadState)?;
            let status = statuses
                .entry(item.id.clone())
                .or_insert_with(|| DistributionQueueItemStatus {
                    state: ItemState::Queued,
                    attempts: 0,
                    entered: Utc::now(),
                    queue_name: self.name.clone(),
                });
            status.attempts += 1;
            status.clone()
        };
        Ok(Some(DistributionQueueEntry {
            id: item.id.clone(),
            item,
            status,
        }))
    }

    async fn get_item(&self, id: &str) -> Result<Option<DistributionQueueEntry>> {
        let item = self
            .items
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .iter()
            .find(|item| item.id == id)
            .cloned();
        item.map(|item| self.entry(item)).transpose()
    }

    async fn remove(&self, id: &str) -> Result<Option<DistributionQueueEntry>> {
        let removed = {
            let mut items = self
                .items
                .lock()
                .map_err(|_| DistributionQueueError::BadState)?;
            items
                .iter()
                .position(|item| item.id == id)
                .and_then(|position| items.remove(position))
        };
        let Some(item) = removed else {
            return Ok(None);
        };
        self.capacity.add_permits(1);
        let entry = self.entry(item)?;
        self.statuses
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .remove(id);
        let name = &self.name;
        tracing::debug!(%name, %id, "Removed item {id} from queue {name}");
        Ok(Some(entry))
    }

    async fn get_items(
        &self,
        skip: usize,
        limit: Option<usize>,
    ) -> Result<Vec<DistributionQueueEntry>> {
        let items: Vec<_> = self
            .items
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .iter()
            .skip(skip)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        items.into_iter().map(|item| self.entry(item)).collect()
    }

    async fn get_status(&self, id: &str) -> Result<Option<DistributionQueueItemStatus>> {
        self.status(id)
    }

    async fn get_state(&self) -> Result<DistributionQueueState> {
        let Some(item) = self.head()? else {
            return Ok(DistributionQueueState::Idle);
        };
        Ok(match self.status(&item.id)? {
            Some(status) if status.state == ItemState::Error || status.attempts > 1 => {
                DistributionQueueState::Blocked
            }
            _ => DistributionQueueState::Running,
        })
    }

    async fn len(&self) -> Result<usize> {
        Ok(self
            .items
            .lock()
            .map_err(|_| DistributionQueueError::BadState)?
            .len())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::job::Properties;

    fn queue() -> SimpleDistributionQueue {
        SimpleDistributionQueue::new("queue", &DistributionConfig::default())
    }

    fn item(id: &str) -> DistributionQueueItem {
        let properties: Properties =
            serde_json::from_value(json!({"path": format!("/content/{id}")})).unwrap();
        DistributionQueueItem::new(id, properties)
    }

    #[tokio::test]
    async fn added_item_is_queued_without_attempts() {
        let queue = queue();
        let added = queue.add(item("a")).await.unwrap().unwrap();

        let entry = queue.get_item("a").await.unwrap().unwrap();
        assert_eq!(entry, added);
        assert_eq!(entry.item, item("a"));
        assert_eq!(entry.status.state, ItemState::Queued);
        assert_eq!(entry.status.attempts, 0);
        assert_eq!(entry.status.queue_name, "queue");
        assert!(queue.get_item("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn every_head_peek_counts_an_attempt() {
        let queue = queue();
        queue.add(item("a")).await.unwrap();
        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Running);

        assert_eq!(queue.get_head().await.unwrap().unwrap().status.attempts, 1);
        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Running);
        assert_eq!(queue.get_head().await.unwrap().unwrap().status.attempts, 2);

        assert_eq!(queue.get_status("a").await.unwrap().unwrap().attempts, 2);
        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Blocked);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_peeks_each_count() {
        let queue = Arc::new(queue());
        queue.add(item("a")).await.unwrap();

        let peeks: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get_head().await })
            })
            .collect();
        for peek in peeks {
            assert!(peek.await.unwrap().unwrap().is_some());
        }

        assert_eq!(queue.get_status("a").await.unwrap().unwrap().attempts, 4);
    }

    #[tokio::test]
    async fn fifo_order_and_remove() {
        let queue = queue();
        for id in ["a", "b", "c"] {
            queue.add(item(id)).await.unwrap();
        }

        assert_eq!(queue.get_head().await.unwrap().unwrap().id, "a");
        assert!(queue.remove("missing").await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 3);

        let removed = queue.remove("b").await.unwrap().unwrap();
        assert_eq!(removed.item, item("b"));
        assert!(queue.get_status("b").await.unwrap().is_none());

        let removed = queue.remove("a").await.unwrap().unwrap();
        assert_eq!(removed.status.attempts, 1);
        assert_eq!(queue.get_head().await.unwrap().unwrap().id, "c");

        queue.remove("c").await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(queue.get_head().await.unwrap().is_none());
        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Idle);
    }

    #[tokio::test]
    async fn get_items_honours_skip_and_limit() {
        let queue = queue();
        for id in ["a", "b", "c", "d"] {
            queue.add(item(id)).await.unwrap();
        }
        let ids = |entries: Vec<DistributionQueueEntry>| {
            entries.into_iter().map(|entry| entry.id).collect::<Vec<_>>()
        };

        assert_eq!(ids(queue.get_items(0, None).await.unwrap()), ["a", "b", "c", "d"]);
        assert_eq!(ids(queue.get_items(1, Some(2)).await.unwrap()), ["b", "c"]);
        assert_eq!(ids(queue.get_items(3, Some(5)).await.unwrap()), ["d"]);
        assert!(queue.get_items(10, None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_after_timeout() {
        let config = DistributionConfig::default()
            .with_capacity(1)
            .with_add_timeout(Duration::from_secs(10));
        let queue = SimpleDistributionQueue::new("small", &config);
        queue.add(item("a")).await.unwrap().unwrap();

        let started = tokio::time::Instant::now();
        assert_matches!(queue.add(item("b")).await, Ok(None));
        assert!(started.elapsed() >= Duration::from_secs(10));

        let status = queue.get_status("b").await.unwrap().unwrap();
        assert_eq!(status.state, ItemState::Error);
        assert_eq!(queue.len().await.unwrap(), 1);

        queue.remove("a").await.unwrap();
        assert!(queue.add(item("b")).await.unwrap().is_some());
        assert_eq!(
            queue.get_status("b").await.unwrap().unwrap().state,
            ItemState::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_add_succeeds_once_space_frees_up() {
        let config = DistributionConfig::default().with_capacity(1);
        let queue = Arc::new(SimpleDistributionQueue::new("small", &config));
        queue.add(item("a")).await.unwrap();

        let waiting = tokio::spawn({
            let queue = queue.clone();
            async move { queue.add(item("b")).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.remove("a").await.unwrap();

        assert!(waiting.await.unwrap().unwrap().is_some());
        assert_eq!(queue.get_head().await.unwrap().unwrap().id, "b");
    }

    #[tokio::test]
    async fn failed_head_blocks_queue() {
        let queue = queue();
        queue.add(item("a")).await.unwrap();
        queue.record("a", ItemState::Error).unwrap();

        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Blocked);
    }

    #[tokio::test]
    async fn adding_a_queued_id_keeps_its_status() {
        let queue = queue();
        queue.add(item("a")).await.unwrap().unwrap();
        queue.get_head().await.unwrap();
        queue.get_head().await.unwrap();

        assert_matches!(queue.add(item("a")).await, Ok(None));
        assert_eq!(queue.len().await.unwrap(), 1);
        let status = queue.get_status("a").await.unwrap().unwrap();
        assert_eq!(status.state, ItemState::Queued);
        assert_eq!(status.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_add_leaves_queued_head_alone() {
        let config = DistributionConfig::default().with_capacity(1);
        let queue = SimpleDistributionQueue::new("small", &config);
        queue.add(item("a")).await.unwrap().unwrap();

        assert_matches!(queue.add(item("a")).await, Ok(None));
        assert_matches!(queue.add(item("b")).await, Ok(None));

        assert_eq!(
            queue.get_status("a").await.unwrap().unwrap().state,
            ItemState::Queued
        );
        assert_eq!(
            queue.get_status("b").await.unwrap().unwrap().state,
            ItemState::Error
        );
        assert_eq!(queue.get_state().await.unwrap(), DistributionQueueState::Running);
    }
}
