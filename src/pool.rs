use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, ProxyError, Result};

const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 16;
const QUEUE_FACTOR: usize = 4;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded pool of worker tasks providing admission control for the proxy
/// pipeline.
///
/// `submit` enqueues onto a bounded channel and awaits when the queue is
/// full, so backpressure reaches the caller instead of dropping work.
/// `stop` signals quit and waits for every worker to exit; jobs already
/// dequeued run to completion, jobs still queued are discarded.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    quit: watch::Sender<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Default worker count: twice the CPU count, clamped to 2..=16.
pub fn default_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS);
    (cpus * 2).clamp(MIN_WORKERS, MAX_WORKERS)
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        let (tx, rx) = mpsc::channel::<Job>(workers * QUEUE_FACTOR);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (quit, _) = watch::channel(false);

        let handles = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                let mut quit = quit.subscribe();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                _ = quit.changed() => {
                                    debug!(worker = id, "worker received quit signal");
                                    return;
                                }
                                job = rx.recv() => job,
                            }
                        };
                        match job {
                            Some(job) => job.await,
                            None => return,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx,
            quit,
            handles: parking_lot::Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Enqueue a job, waiting if the queue is full.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopped() {
            return Err(Error::Proxy(ProxyError::PoolStopped));
        }
        self.tx
            .send(Box::pin(job))
            .await
            .map_err(|_| Error::Proxy(ProxyError::PoolStopped))
    }

    /// Signal quit and wait for all workers to exit.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.quit.send(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}
