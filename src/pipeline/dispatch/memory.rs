use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{Delivery, DispatchError, Task, TaskQueue};
use crate::models::TaskReference;

/// In-process queue on a tokio channel. Delayed tasks are held by a timer
/// task until they become deliverable. Nothing survives a restart.
pub struct MemoryTaskQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: AtomicBool,
    acked: AtomicUsize,
    /// Un-acked deliveries per task reference.
    outstanding: std::sync::Mutex<HashMap<TaskReference, usize>>,
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            acked: AtomicUsize::new(0),
            outstanding: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Refuse further enqueues.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Non-blocking receive. Returns `None` when nothing is deliverable now
    /// or another consumer is currently waiting.
    pub fn try_next(&self) -> Option<Delivery> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    fn track(&self, reference: TaskReference, delta: isize) -> Result<(), DispatchError> {
        let mut outstanding = self
            .outstanding
            .lock()
            .map_err(|_| DispatchError::Queue("outstanding map poisoned".into()))?;
        let count = outstanding.entry(reference).or_insert(0);
        *count = count.saturating_add_signed(delta);
        if *count == 0 {
            outstanding.remove(&reference);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: Task, delay: Duration) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::QueueClosed);
        }
        let delivery = Delivery {
            id: Uuid::new_v4(),
            task,
        };
        if delay.is_zero() {
            self.tx
                .send(delivery)
                .map_err(|_| DispatchError::QueueClosed)?;
            return self.track(task.reference, 1);
        }
        self.track(task.reference, 1)?;

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(delivery).is_err() {
                tracing::warn!("Delayed task dropped: queue receiver gone");
            }
        });
        Ok(())
    }

    async fn next(&self) -> Result<Delivery, DispatchError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(DispatchError::QueueClosed)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        self.track(delivery.task.reference, -1)
    }

    async fn is_pending(&self, reference: &TaskReference) -> Result<bool, DispatchError> {
        let outstanding = self
            .outstanding
            .lock()
            .map_err(|_| DispatchError::Queue("outstanding map poisoned".into()))?;
        Ok(outstanding.contains_key(reference))
    }
}
