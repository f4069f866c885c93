//! Background removal of rows found expired at read time.
//!
//! Reads enqueue a [`CleanupJob`] and return without waiting. One worker task
//! drains a bounded channel; when the channel is full the job is dropped and
//! the row simply stays until the next read finds it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::ResourceType;
use crate::error::DriverError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupJob {
    DeleteSession(Uuid),
    RevokeToken(Uuid),
    DeleteCacheEntry { resource_type: ResourceType, key: String },
}

pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), DriverError>> + Send + 'static>>;

/// Performs one cleanup job against the backend.
pub type CleanupFn = Arc<dyn Fn(CleanupJob) -> CleanupFuture + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of cleanup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl ReaperStats {
    pub fn pending(&self) -> u64 {
        self.enqueued
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

pub struct Reaper {
    sender: mpsc::Sender<CleanupJob>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl Reaper {
    /// Spawns the worker. Must be called inside a tokio runtime.
    pub fn spawn(capacity: usize, cleanup_fn: CleanupFn) -> Self {
        let (tx, mut rx) = mpsc::channel::<CleanupJob>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker_counters = counters.clone();

        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match cleanup_fn(job.clone()).await {
                    Ok(()) => {
                        worker_counters.completed.fetch_add(1, Ordering::Relaxed);
                        debug!(?job, "expired row removed");
                    }
                    Err(e) => {
                        worker_counters.failed.fetch_add(1, Ordering::Relaxed);
                        warn!(?job, error = %e, "expired row cleanup failed");
                    }
                }
            }
        });

        Self {
            sender: tx,
            counters,
            worker,
        }
    }

    /// Queues a job without waiting. Never fails the caller.
    pub fn schedule(&self, job: CleanupJob) {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(?job, "cleanup queue full; dropping job");
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(?job, "cleanup queue closed; dropping job");
            }
        }
    }

    pub fn stats(&self) -> ReaperStats {
        ReaperStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Closes the queue and waits for queued jobs to finish.
    pub async fn shutdown(self) -> ReaperStats {
        let Self {
            sender,
            counters,
            worker,
        } = self;
        drop(sender);
        if let Err(e) = worker.await {
            warn!(error = %e, "cleanup worker panicked");
        }
        ReaperStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording() -> (CleanupFn, Arc<Mutex<Vec<CleanupJob>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let f: CleanupFn = Arc::new(move |job: CleanupJob| -> CleanupFuture {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().push(job);
                Ok::<(), DriverError>(())
            })
        });
        (f, seen)
    }

    #[tokio::test]
    async fn scheduled_jobs_run_before_shutdown_returns() {
        let (f, seen) = recording();
        let reaper = Reaper::spawn(8, f);
        let id = Uuid::now_v7();
        reaper.schedule(CleanupJob::DeleteSession(id));
        reaper.schedule(CleanupJob::DeleteCacheEntry {
            resource_type: ResourceType::SESSION,
            key: "k".into(),
        });
        let stats = reaper.shutdown().await;
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending(), 0);
        assert_eq!(seen.lock()[0], CleanupJob::DeleteSession(id));
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let f: CleanupFn = Arc::new(|_: CleanupJob| -> CleanupFuture {
            Box::pin(async { Err::<(), DriverError>(DriverError::backend("storage offline")) })
        });
        let reaper = Reaper::spawn(4, f);
        reaper.schedule(CleanupJob::RevokeToken(Uuid::now_v7()));
        let stats = reaper.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let wait = gate.clone();
        let f: CleanupFn = Arc::new(move |_: CleanupJob| -> CleanupFuture {
            let wait = wait.clone();
            Box::pin(async move {
                if let Ok(permit) = wait.acquire().await {
                    permit.forget();
                }
                Ok::<(), DriverError>(())
            })
        });
        let reaper = Reaper::spawn(1, f);
        for _ in 0..5 {
            reaper.schedule(CleanupJob::DeleteSession(Uuid::now_v7()));
        }
        let stats = reaper.stats();
        assert!(stats.dropped >= 3, "dropped {}", stats.dropped);
        assert_eq!(stats.enqueued + stats.dropped, 5);
        gate.add_permits(stats.enqueued as usize);
        let stats = reaper.shutdown().await;
        assert_eq!(stats.completed, stats.enqueued);
    }
}
