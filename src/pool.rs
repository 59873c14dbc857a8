//! Bounded worker pool for bulk operations.

use crate::config::{OverflowPolicy, PoolConfig};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Errors from submitting work.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool queue is full")]
    Full,

    #[error("worker pool is shut down")]
    Closed,
}

/// A fixed number of workers draining a bounded queue.
pub struct WorkerPool {
    queue: mpsc::Sender<Job>,
    overflow: OverflowPolicy,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `config.workers` workers behind a queue of `config.queue_depth`.
    #[must_use]
    pub fn new(config: &PoolConfig) -> Self {
        let (queue, jobs) = mpsc::channel(config.queue_depth.max(1));
        let jobs = Arc::new(Mutex::new(jobs));
        let workers = (0..config.workers.max(1))
            .map(|id| tokio::spawn(worker(id, Arc::clone(&jobs))))
            .collect();
        Self {
            queue,
            overflow: config.overflow,
            workers,
        }
    }

    /// Queue `fut` and return a receiver for its output.
    ///
    /// When the queue is full, `block` waits for room and `reject` fails with
    /// [`PoolError::Full`]. The receiver errors if the job panicked.
    pub async fn submit<F, T>(&self, fut: F) -> Result<oneshot::Receiver<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(fut.await);
        });

        match self.overflow {
            OverflowPolicy::Block => self
                .queue
                .send(job)
                .await
                .map_err(|_| PoolError::Closed)?,
            OverflowPolicy::Reject => self.queue.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PoolError::Full,
                mpsc::error::TrySendError::Closed(_) => PoolError::Closed,
            })?,
        }
        Ok(rx)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn worker(id: usize, jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        trace!(worker = id, "Running job");
        // A panicking job must not take the worker down with it.
        if let Err(e) = tokio::spawn(job).await {
            warn!(worker = id, error = %e, "Pool job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(workers: usize, queue_depth: usize, overflow: OverflowPolicy) -> PoolConfig {
        PoolConfig {
            workers,
            queue_depth,
            overflow,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_block_policy_completes_everything() {
        let pool = WorkerPool::new(&config(2, 1, OverflowPolicy::Block));
        let done = Arc::new(AtomicUsize::new(0));

        let mut receivers = Vec::new();
        for i in 0..20 {
            let done = Arc::clone(&done);
            let rx = pool
                .submit(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    i
                })
                .await
                .unwrap();
            receivers.push(rx);
        }

        let results: Vec<_> = futures::future::join_all(receivers).await;
        let values: Vec<i32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
        assert_eq!(done.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_reject_policy_reports_full() {
        let pool = WorkerPool::new(&config(1, 1, OverflowPolicy::Reject));
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupy the only worker.
        let busy = pool
            .submit(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .await
            .unwrap();
        started_rx.await.unwrap();

        // Fill the queue.
        let queued = pool.submit(async { 1 }).await.unwrap();
        assert_eq!(pool.submit(async { 2 }).await.unwrap_err(), PoolError::Full);

        release_tx.send(()).unwrap();
        busy.await.unwrap();
        assert_eq!(queued.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker_alive() {
        let pool = WorkerPool::new(&config(1, 4, OverflowPolicy::Block));
        let failed = pool
            .submit(async {
                panic!("boom");
            })
            .await
            .unwrap();
        assert!(failed.await.is_err());

        let ok = pool.submit(async { "still here" }).await.unwrap();
        assert_eq!(ok.await.unwrap(), "still here");
    }
}
