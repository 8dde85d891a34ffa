//! Background queue worker

use std::time::Duration;
use tokio::sync::watch;

use super::WorkQueue;

/// Polls the queue and runs jobs one at a time until shutdown
pub struct QueueWorker {
    queue: WorkQueue,
    worker_id: String,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(queue: WorkQueue, worker_id: impl Into<String>) -> Self {
        let poll_interval = queue.config().poll_interval();
        Self {
            queue,
            worker_id: worker_id.into(),
            poll_interval,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until `shutdown` flips to true. A job in progress is finished
    /// before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.worker_id, "Queue worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.queue.process_next(&self.worker_id).await {
                Ok(processed) => !processed,
                Err(e) => {
                    tracing::error!(worker_id = %self.worker_id, error = %e, "Queue poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "Queue worker stopped");
    }
}
