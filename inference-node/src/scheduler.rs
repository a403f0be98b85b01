use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batcher::Batch;
use crate::error::NodeError;

/// Dispatch side of one GPU worker: availability flag plus input channel.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    worker_id: usize,
    available: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Batch>,
}

impl WorkerHandle {
    pub fn new(
        worker_id: usize,
        available: Arc<AtomicBool>,
        sender: mpsc::UnboundedSender<Batch>,
    ) -> Self {
        Self {
            worker_id,
            available,
            sender,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Hand a sealed batch to the worker. If the worker is gone the batch is
    /// failed rather than abandoned.
    pub fn dispatch(&self, batch: Batch) {
        if let Err(rejected) = self.sender.send(batch) {
            rejected.0.fail(NodeError::ShuttingDown);
        }
    }
}

/// Assigns sealed batches to idle workers.
///
/// First-fit scan in fixed worker order; when every worker is busy the batch
/// goes back to the tail of the batch channel after a short backoff, so
/// backlogged batches keep their relative order but may interleave with
/// newcomers.
pub struct Scheduler {
    workers: Vec<WorkerHandle>,
    batch_rx: mpsc::UnboundedReceiver<Batch>,
    batch_tx: mpsc::UnboundedSender<Batch>,
    token: CancellationToken,
}

impl Scheduler {
    const BACKOFF: Duration = Duration::from_millis(10);

    pub fn new(
        workers: Vec<WorkerHandle>,
        batch_rx: mpsc::UnboundedReceiver<Batch>,
        batch_tx: mpsc::UnboundedSender<Batch>,
        token: CancellationToken,
    ) -> Self {
        Self {
            workers,
            batch_rx,
            batch_tx,
            token,
        }
    }

    pub async fn run(mut self) {
        info!(workers = self.workers.len(), "Scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                batch = self.batch_rx.recv() => {
                    let Some(batch) = batch else { break };
                    self.place(batch).await;
                }
            }
        }

        // Anything still queued at shutdown is completed with an error.
        self.batch_rx.close();
        while let Ok(batch) = self.batch_rx.try_recv() {
            batch.fail(NodeError::ShuttingDown);
        }
        info!("Scheduler stopped");
    }

    async fn place(&mut self, batch: Batch) {
        match self.find_available_worker() {
            Some(worker) => {
                debug!(
                    worker_id = worker.worker_id(),
                    size = batch.size(),
                    "Batch scheduled"
                );
                worker.dispatch(batch);
            }
            None => {
                debug!("No available worker, requeuing batch");
                tokio::time::sleep(Self::BACKOFF).await;
                if let Err(rejected) = self.batch_tx.send(batch) {
                    rejected.0.fail(NodeError::ShuttingDown);
                }
            }
        }
    }

    fn find_available_worker(&self) -> Option<&WorkerHandle> {
        self.workers.iter().find(|worker| worker.is_available())
    }
}
