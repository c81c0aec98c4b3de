//! Task dispatch: at-least-once delivery of consultation work to workers.
//!
//! A [`Dispatcher`] claims a fresh [`TaskReference`] on the record and then
//! enqueues the first attempt. Workers pull deliveries from a [`TaskQueue`],
//! hand them to the controller and apply the [`BackoffPolicy`] on failure.

pub mod memory;
pub mod retry;
pub mod sqlite;
pub mod worker;

pub use memory::MemoryTaskQueue;
pub use retry::BackoffPolicy;
pub use sqlite::SqliteTaskQueue;
pub use worker::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{ConsultationPatch, DatabaseError, RecordStore};
use crate::models::{ConsultationStatus, TaskReference};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Consultation {0} already has an outstanding task or is not queued")]
    AlreadyDispatched(Uuid),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Task queue error: {0}")]
    Queue(String),
}

/// One unit of work: advance a consultation under a given task reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub consultation_id: Uuid,
    pub reference: TaskReference,
    /// 1-based delivery attempt.
    pub attempt: u32,
}

impl Task {
    pub fn first(consultation_id: Uuid, reference: TaskReference) -> Self {
        Self {
            consultation_id,
            reference,
            attempt: 1,
        }
    }

    /// Same task, next attempt. The reference is kept.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..*self
        }
    }
}

/// A task handed to a worker. Must be acked once handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: Uuid,
    pub task: Task,
}

/// Transport carrying tasks from the dispatcher to workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make `task` deliverable after `delay`.
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), DispatchError>;

    /// Wait for the next deliverable task.
    async fn next(&self) -> Result<Delivery, DispatchError>;

    /// Remove a handled delivery. Un-acked deliveries may be redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError>;

    /// Whether any delivery for `reference` is still waiting, leased or
    /// un-acked.
    async fn is_pending(&self, reference: &TaskReference) -> Result<bool, DispatchError>;
}

/// Hands consultations to the task queue, one outstanding task at a time.
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    /// Claim a fresh task reference for a `queued` consultation and enqueue
    /// its first attempt.
    pub async fn dispatch(&self, consultation_id: Uuid) -> Result<TaskReference, DispatchError> {
        let reference = TaskReference::new();
        if !self.store.claim_task(&consultation_id, &reference)? {
            return Err(DispatchError::AlreadyDispatched(consultation_id));
        }

        if let Err(e) = self
            .queue
            .enqueue(Task::first(consultation_id, reference), Duration::ZERO)
            .await
        {
            self.fail_undelivered(consultation_id, reference, &e);
            return Err(e);
        }

        tracing::info!(
            consultation_id = %consultation_id,
            task_reference = %reference,
            "Task dispatched"
        );
        Ok(reference)
    }

    /// Whether a task under `reference` can still reach a worker.
    pub async fn is_outstanding(&self, reference: &TaskReference) -> Result<bool, DispatchError> {
        self.queue.is_pending(reference).await
    }

    /// The task never reached the queue: leave an explicit failure on the
    /// record so it can be reprocessed. If even that write fails the record
    /// stays `queued` under a reference with no delivery, which `reprocess`
    /// also accepts.
    fn fail_undelivered(&self, consultation_id: Uuid, reference: TaskReference, cause: &DispatchError) {
        let patch = ConsultationPatch::status(ConsultationStatus::Failed)
            .with_error(&format!("Task could not be enqueued: {cause}"))
            .only_for_task(Some(reference));
        match self
            .store
            .update(&consultation_id, &[ConsultationStatus::Queued], &patch)
        {
            Ok(true) => tracing::error!(
                consultation_id = %consultation_id,
                task_reference = %reference,
                error = %cause,
                "Enqueue failed, consultation marked failed"
            ),
            Ok(false) => tracing::warn!(
                consultation_id = %consultation_id,
                task_reference = %reference,
                "Enqueue failed after the consultation moved on"
            ),
            Err(e) => tracing::error!(
                consultation_id = %consultation_id,
                task_reference = %reference,
                error = %e,
                "Enqueue failed and the failure could not be recorded"
            ),
        }
    }

    /// Enqueue the next attempt of `task` after `delay`.
    pub async fn redeliver(&self, task: &Task, delay: Duration) -> Result<Task, DispatchError> {
        let next = task.retry();
        self.queue.enqueue(next, delay).await?;
        tracing::info!(
            consultation_id = %task.consultation_id,
            task_reference = %task.reference,
            attempt = next.attempt,
            delay_ms = delay.as_millis() as u64,
            "Task scheduled for retry"
        );
        Ok(next)
    }
}
