use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use fxhash::FxHashMap;

use super::{
    simple::SimpleDistributionQueue, DistributionQueue, DistributionQueueEntry,
    DistributionQueueError,
};
use crate::{
    config::DistributionConfig,
    scheduler::{
        executor::{JobContext, ScheduledTask, TaskError},
        ScheduleOptions, Scheduler, Trigger,
    },
};

type Result<T> = std::result::Result<T, DistributionQueueError>;

/// Handles the items of queues with processing enabled.
#[async_trait]
pub trait DistributionQueueProcessor: Send + Sync {
    /// Returns whether the item was processed. Processed items are removed from the queue,
    /// a failed item stays at the head and stops processing until the next run.
    async fn process(&self, queue_name: &str, entry: &DistributionQueueEntry) -> bool;
}

/// Creates [`SimpleDistributionQueue`]s by name and drains them on the [`Scheduler`].
#[derive(Debug)]
pub struct SimpleDistributionQueueProvider {
    name: String,
    config: DistributionConfig,
    scheduler: Scheduler,
    queues: RwLock<FxHashMap<String, Arc<SimpleDistributionQueue>>>,
    processing: Mutex<Vec<String>>,
}

impl SimpleDistributionQueueProvider {
    pub fn new(name: impl Into<String>, config: DistributionConfig, scheduler: Scheduler) -> Self {
        Self {
            name: name.into(),
            config,
            scheduler,
            queues: Default::default(),
            processing: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the queue named `queue_name`, creating it if needed.
    pub fn get_queue(&self, queue_name: &str) -> Result<Arc<SimpleDistributionQueue>> {
        let key = format!("{}{queue_name}", self.name);
        if let Some(queue) = self
            .queues
            .read()
            .map_err(|_| DistributionQueueError::BadState)?
            .get(&key)
        {
            return Ok(queue.clone());
        }
        Ok(self
            .queues
            .write()
            .map_err(|_| DistributionQueueError::BadState)?
            .entry(key)
            .or_insert_with(|| Arc::new(SimpleDistributionQueue::new(queue_name, &self.config)))
            .clone())
    }

    /// Schedules a periodic, non-concurrent processing task for each named queue.
    pub fn enable_queue_processing<T: AsRef<str>>(
        &self,
        processor: Arc<dyn DistributionQueueProcessor>,
        queue_names: impl IntoIterator<Item = T>,
    ) -> Result<()> {
        for queue_name in queue_names {
            let queue = self.get_queue(queue_name.as_ref())?;
            let task_name = self.task_name(queue_name.as_ref());
            self.scheduler.schedule(
                ScheduleOptions::new(
                    task_name.clone(),
                    Trigger::Periodic(self.config.processing_interval),
                )
                .can_run_concurrently(false),
                Arc::new(QueueProcessingTask {
                    queue,
                    processor: processor.clone(),
                }),
            )?;
            let mut processing = self
                .processing
                .lock()
                .map_err(|_| DistributionQueueError::BadState)?;
            if !processing.contains(&task_name) {
                processing.push(task_name);
            }
        }
        Ok(())
    }

    /// Unschedules the processing of every queue enabled through this provider.
    pub fn disable_queue_processing(&self) -> Result<()> {
        let task_names = std::mem::take(
            &mut *self
                .processing
                .lock()
                .map_err(|_| DistributionQueueError::BadState)?,
        );
        for task_name in task_names {
            if !self.scheduler.unschedule(&task_name)? {
                tracing::warn!(%task_name, "Processing task {task_name} was already gone");
            }
        }
        Ok(())
    }

    /// Scoped by provider so providers sharing a scheduler keep separate tasks.
    fn task_name(&self, queue_name: &str) -> String {
        format!("simple-queueProcessor-{}-{queue_name}", self.name)
    }
}

struct QueueProcessingTask {
    queue: Arc<SimpleDistributionQueue>,
    processor: Arc<dyn DistributionQueueProcessor>,
}

#[async_trait]
impl ScheduledTask for QueueProcessingTask {
    async fn execute(&self, _context: JobContext) -> std::result::Result<(), TaskError> {
        let queue_name = self.queue.name();
        while let Some(entry) = self.queue.get_head().await? {
            let id = &entry.id;
            if !self.processor.process(queue_name, &entry).await {
                tracing::warn!(%queue_name, %id, "Processing of item {id} in queue {queue_name} failed");
                break;
            }
            self.queue.remove(id).await?;
        }
        Ok(())
    }
}
