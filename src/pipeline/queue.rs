//! Bounded reading queue drained by a fixed set of workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ReadingJob, ReadingPipeline, SaveOutcome};
use crate::error::{Error, PipelineError};

/// Counters shared by all workers.
#[derive(Debug, Default)]
pub struct QueueStats {
    submitted: AtomicU64,
    saved: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub saved: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submission side of the queue.
#[derive(Clone)]
pub struct ReadingSender {
    tx: mpsc::Sender<ReadingJob>,
    stats: Arc<QueueStats>,
}

impl ReadingSender {
    /// Queue a reading. Waits while the queue is full.
    pub async fn submit(&self, job: ReadingJob) -> Result<(), PipelineError> {
        self.tx
            .send(job)
            .await
            .map_err(|_| PipelineError::QueueClosed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// A sender whose queue is read by the caller instead of workers.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<ReadingJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = Self {
            tx,
            stats: Arc::new(QueueStats::default()),
        };
        (sender, rx)
    }
}

/// Fixed worker pool running readings through a [`ReadingPipeline`].
pub struct WorkerPool {
    sender: Option<ReadingSender>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<QueueStats>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `capacity` readings.
    pub fn start(pipeline: Arc<ReadingPipeline>, capacity: usize, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(QueueStats::default());

        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = Arc::clone(&rx);
                let pipeline = Arc::clone(&pipeline);
                let stats = Arc::clone(&stats);
                tokio::spawn(worker_loop(index, rx, pipeline, stats))
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), capacity, "Reading workers started");
        Self {
            sender: Some(ReadingSender {
                tx,
                stats: Arc::clone(&stats),
            }),
            workers: handles,
            stats,
        }
    }

    /// A handle for submitting readings. `None` after shutdown.
    pub fn sender(&self) -> Option<ReadingSender> {
        self.sender.clone()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the submission side and wait for the workers to drain.
    ///
    /// Submissions still held by cloned senders keep the queue open until
    /// those senders are dropped.
    pub async fn shutdown(mut self) -> Result<QueueStatsSnapshot, PipelineError> {
        self.sender.take();
        let mut failure = None;
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Reading worker panicked");
                failure = Some(PipelineError::WorkerFailed(e.to_string()));
            }
        }
        let stats = self.stats.snapshot();
        info!(
            submitted = stats.submitted,
            saved = stats.saved,
            skipped = stats.skipped,
            failed = stats.failed,
            "Reading workers stopped"
        );
        failure.map_or(Ok(stats), Err)
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<ReadingJob>>>,
    pipeline: Arc<ReadingPipeline>,
    stats: Arc<QueueStats>,
) {
    debug!(worker = index, "Reading worker running");
    loop {
        // Hold the receiver lock only while waiting for the next job
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let oid = job.reading.oid;
        match pipeline.process(job).await {
            Ok(SaveOutcome::Saved(vehicle)) => {
                stats.saved.fetch_add(1, Ordering::Relaxed);
                debug!(worker = index, oid, %vehicle, "Reading saved");
            }
            Ok(SaveOutcome::Skipped(reason)) => {
                stats.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(worker = index, oid, %reason, "Reading skipped");
            }
            Err(Error::Resolve(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker = index, oid, error = %e, "Reading dropped");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = index, oid, error = %e, "Failed to persist reading");
            }
        }
    }
    debug!(worker = index, "Reading worker exiting");
}
