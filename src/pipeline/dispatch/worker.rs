use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BackoffPolicy, Delivery, DispatchError};
use crate::models::Stage;
use crate::pipeline::controller::{AdvanceOutcome, PipelineController, PipelineError};

/// Back-off after a transport error before polling again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Handled(AdvanceOutcome),
    Retried { next_attempt: u32, delay: Duration },
    /// Retry budget spent. `recorded` is false when the record had already
    /// moved on and nothing was written.
    Failed { recorded: bool },
}

/// Handle one delivery end to end: run it, then retry, record the failure,
/// or ack.
///
/// The follow-up (retry enqueue or failure record) is persisted before the
/// ack. An error here leaves the delivery un-acked.
pub async fn process_delivery(
    controller: &PipelineController,
    policy: &BackoffPolicy,
    delivery: &Delivery,
) -> Result<Disposition, DispatchError> {
    let task = delivery.task;
    let dispatcher = controller.dispatcher();

    let disposition = match controller.run_task(&task).await {
        Ok(outcome) => {
            if let AdvanceOutcome::Skipped(reason) = &outcome {
                tracing::debug!(
                    consultation_id = %task.consultation_id,
                    attempt = task.attempt,
                    reason = ?reason,
                    "Delivery skipped"
                );
            }
            Disposition::Handled(outcome)
        }
        Err(err) => {
            tracing::warn!(
                consultation_id = %task.consultation_id,
                task_reference = %task.reference,
                attempt = task.attempt,
                max_attempts = policy.max_attempts,
                transient = err.is_transient(),
                error = %err,
                "Pipeline attempt failed"
            );

            let mut message = format!(
                "{err} (attempt {} of {})",
                task.attempt, policy.max_attempts
            );

            let mut retried = None;
            if policy.should_retry(task.attempt) {
                let delay = policy.delay_for(task.attempt);
                match dispatcher.redeliver(&task, delay).await {
                    Ok(next) => {
                        retried = Some(Disposition::Retried {
                            next_attempt: next.attempt,
                            delay,
                        })
                    }
                    Err(e) => {
                        tracing::error!(
                            consultation_id = %task.consultation_id,
                            error = %e,
                            "Could not schedule retry"
                        );
                        message = format!("{message}; retry could not be scheduled: {e}");
                    }
                }
            }

            match retried {
                Some(disposition) => disposition,
                None => Disposition::Failed {
                    recorded: record_failure(controller, &task, err.stage(), &message)?,
                },
            }
        }
    };

    dispatcher.queue().ack(delivery).await?;
    Ok(disposition)
}

fn record_failure(
    controller: &PipelineController,
    task: &super::Task,
    failed_stage: Option<Stage>,
    message: &str,
) -> Result<bool, DispatchError> {
    match controller.record_failure(task.consultation_id, task.reference, failed_stage, message) {
        Ok(recorded) => Ok(recorded),
        Err(PipelineError::Database(e)) => Err(DispatchError::Database(e)),
        Err(other) => Err(DispatchError::Queue(other.to_string())),
    }
}

/// Fixed set of tokio workers pulling from the dispatcher's queue.
pub struct WorkerPool {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        controller: Arc<PipelineController>,
        policy: BackoffPolicy,
        worker_count: usize,
    ) -> Self {
        let token = CancellationToken::new();
        let handles = (0..worker_count.max(1))
            .map(|worker_id| {
                let controller = Arc::clone(&controller);
                let token = token.clone();
                tokio::spawn(async move { run_worker(worker_id, controller, policy, token).await })
            })
            .collect();

        tracing::info!(workers = worker_count.max(1), "Worker pool started");
        Self { token, handles }
    }

    /// Stop pulling new deliveries and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    controller: Arc<PipelineController>,
    policy: BackoffPolicy,
    token: CancellationToken,
) {
    let queue = controller.dispatcher().queue();
    tracing::debug!(worker_id, "Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = queue.next() => next,
        };

        match next {
            Ok(delivery) => {
                // In-flight work is never cancelled.
                if let Err(e) = process_delivery(&controller, &policy, &delivery).await {
                    tracing::error!(
                        worker_id,
                        consultation_id = %delivery.task.consultation_id,
                        error = %e,
                        "Delivery left un-acked"
                    );
                }
            }
            Err(DispatchError::QueueClosed) => break,
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Task queue error");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
}
