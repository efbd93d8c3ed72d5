use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::ActivityLog;
use crate::database::Repository;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1_000,
            worker_count: 2,
        }
    }
}

/// Fire-and-forget activity logger. Logs flow through a bounded queue into
/// background workers that batch-insert into the embedded store.
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Sender<ActivityLog>,
}

impl ActivityLogger {
    pub fn new(repository: Arc<Repository>, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);

        info!(
            "Initializing activity logger: queue={}, batch={}, workers={}",
            config.queue_capacity, config.batch_size, config.worker_count
        );

        for worker_id in 0..config.worker_count {
            let repository = repository.clone();
            let receiver = receiver.clone();
            let config = config.clone();

            tokio::spawn(async move {
                Self::worker_loop(worker_id, repository, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Non-blocking enqueue; a full queue drops the log with a warning.
    pub fn log(&self, activity: ActivityLog) {
        if let Err(e) = self.sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    async fn worker_loop(
        worker_id: usize,
        repository: Arc<Repository>,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        debug!("Activity logger worker {} started", worker_id);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        let mut batch: Vec<ActivityLog> = Vec::with_capacity(config.batch_size);

        loop {
            let deadline = tokio::time::Instant::now() + batch_timeout;

            while batch.len() < config.batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        Self::flush(&repository, &batch, worker_id).await;
                        debug!("Activity logger worker {} shutting down", worker_id);
                        return;
                    }
                    Err(_) => break,
                }
            }

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            Self::flush(&repository, &batch, worker_id).await;
            batch.clear();
        }
    }

    async fn flush(repository: &Repository, batch: &[ActivityLog], worker_id: usize) {
        if batch.is_empty() {
            return;
        }

        match repository.insert_activity_batch(batch).await {
            Ok(inserted) => {
                debug!("Worker {} inserted {} activity logs", worker_id, inserted)
            }
            Err(e) => error!("Worker {} failed to insert activity batch: {}", worker_id, e),
        }
    }
}
