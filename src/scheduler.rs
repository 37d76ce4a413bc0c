//! The job scheduler seam: durable, at-least-once execution of delivery
//! tasks with priority, queue and run-at controls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::event::EnqueueOptions;
use crate::serializer::SerializedRecord;
use crate::Result;

/// Payload of one delivery job.
///
/// A requeued subset is a new task with `requeue_depth` one higher than
/// the task it was split from; nothing else links the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub app_name: Option<String>,
    pub records: Vec<SerializedRecord>,
    #[serde(default)]
    pub requeue_depth: u32,
}

impl DeliveryTask {
    pub fn new(app_name: Option<String>, records: Vec<SerializedRecord>) -> Self {
        Self {
            app_name,
            records,
            requeue_depth: 0,
        }
    }

    /// A follow-up task for `records`, one requeue deeper.
    pub fn requeue(&self, records: Vec<SerializedRecord>) -> Self {
        Self {
            app_name: self.app_name.clone(),
            records,
            requeue_depth: self.requeue_depth + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accepts delivery tasks for asynchronous execution.
///
/// Retries of failed tasks (backoff, attempt limits, dead-lettering) are
/// the scheduler's own policy.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn enqueue(&self, task: DeliveryTask, options: EnqueueOptions) -> Result<()>;
}

#[async_trait]
impl<T: JobScheduler + ?Sized> JobScheduler for Arc<T> {
    async fn enqueue(&self, task: DeliveryTask, options: EnqueueOptions) -> Result<()> {
        (**self).enqueue(task, options).await
    }
}

/// A task together with the options it was enqueued with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedTask {
    pub task: DeliveryTask,
    pub options: EnqueueOptions,
}

/// Keeps enqueued tasks in memory, in enqueue order.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    jobs: Mutex<Vec<EnqueuedTask>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<EnqueuedTask> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes and returns every task enqueued so far.
    pub fn drain(&self) -> Vec<EnqueuedTask> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EnqueuedTask>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobScheduler for InMemoryScheduler {
    async fn enqueue(&self, task: DeliveryTask, options: EnqueueOptions) -> Result<()> {
        self.lock().push(EnqueuedTask { task, options });
        Ok(())
    }
}
