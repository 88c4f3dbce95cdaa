// Single-worker task queue per subscription.
// Jobs run one at a time in submission order, so work pushed here never races
// with other work for the same subscription.
use std::time::Duration;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct OrderedExecutor {
    name: String,
    tx: mpsc::UnboundedSender<Job>,
}

impl OrderedExecutor {
    /// Starts the worker. Must be called from inside a Tokio runtime.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
            tracing::debug!(executor = %worker_name, "ordered executor stopped");
        });
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job. Returns false once the worker is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Queues a job after `delay`. Ordering applies from the moment it is queued.
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            self.execute(job);
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Box::new(job));
        });
    }
}
