use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A fixed number of workers executing callback jobs from a bounded queue, decoupling
///  callback execution from the receive loop.
///
/// Jobs are started in submission order; with a single worker, they also complete in that
///  order. Every job runs in a task of its own, so a panicking job is logged as a failed
///  dispatch and does not take its worker down.
pub struct WorkerPool {
    name: &'static str,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, num_workers: usize, queue_capacity: usize) -> WorkerPool {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..num_workers)
            .map(|worker_id| tokio::spawn(Self::do_loop(name, worker_id, receiver.clone())))
            .collect();

        debug!("started {} worker pool with {} workers", name, num_workers);
        WorkerPool {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queues a job without waiting. Returns false if the job was dropped because the queue
    ///  is full or the pool is shut down.
    pub fn submit(&self, job: impl Future<Output = ()> + Send + 'static) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            debug!("{} worker pool is shut down - dropping job", self.name);
            return false;
        };

        match sender.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("{} worker pool queue is full - dropping job", self.name);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("{} worker pool is shut down - dropping job", self.name);
                false
            }
        }
    }

    /// Stops accepting jobs and waits until all queued and running jobs are finished. Running
    ///  jobs are never interrupted.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(e) = worker.await {
                error!("{} worker terminated abnormally: {}", self.name, e);
            }
        }
        debug!("{} worker pool shut down", self.name);
    }

    async fn do_loop(name: &'static str, worker_id: usize, receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
        loop {
            let job = receiver.lock().await
                .recv().await;
            let Some(job) = job else {
                trace!("{} worker #{}: queue closed", name, worker_id);
                break;
            };

            if let Err(e) = tokio::spawn(job).await {
                error!("{} worker #{}: callback failed: {}", name, worker_id, e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_single_worker_preserves_order() {
        let pool = WorkerPool::new("test", 1, 16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10u64 {
            let order = order.clone();
            assert!(pool.submit(async move {
                // later jobs finish faster - only sequential execution keeps the order
                time::sleep(Duration::from_millis(100 - i * 10)).await;
                order.lock().unwrap().push(i);
            }));
        }
        pool.shutdown().await;

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new("test", 1, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(pool.submit(async { panic!("callback failure") }));
        let c = counter.clone();
        assert!(pool.submit(async move { c.fetch_add(1, Ordering::SeqCst); }));

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_running_jobs() {
        let pool = WorkerPool::new("test", 4, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let c = counter.clone();
            assert!(pool.submit(async move {
                time::sleep(Duration::from_secs(1)).await;
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert!(!pool.submit(async {}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_jobs() {
        let pool = WorkerPool::new("test", 1, 2);

        // nothing runs before this task yields, so the queue fills up
        assert!(pool.submit(async {}));
        assert!(pool.submit(async {}));
        assert!(!pool.submit(async {}));

        pool.shutdown().await;
    }
}
