use std::time::{Duration, Instant};

use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::NodeError;
use crate::queue::QueuedRequest;

/// A group of admitted requests bound for one worker.
///
/// While assembling it is owned by the batcher; once flushed it moves by
/// value into the batch channel and is never mutated again.
#[derive(Debug)]
pub struct Batch {
    pub requests: Vec<QueuedRequest>,
    /// Admission time of the first element, drives the latency trigger.
    pub created_at: Instant,
}

impl Batch {
    pub fn new(first: QueuedRequest) -> Self {
        Self {
            requests: vec![first],
            created_at: Instant::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.requests.len()
    }

    /// Complete every member with the same error.
    pub fn fail(self, error: NodeError) {
        for queued in self.requests {
            queued.complete(Err(error.clone()));
        }
    }
}

/// Size-or-latency batch assembly.
///
/// At most one batch is being assembled at a time: a batch flushes when it
/// reaches `max_batch_size`, when its oldest member has waited
/// `max_batch_latency`, and on shutdown (partial batches included).
pub struct DynamicBatcher {
    max_batch_size: usize,
    max_batch_latency: Duration,
    input: mpsc::Receiver<QueuedRequest>,
    output: mpsc::UnboundedSender<Batch>,
    token: CancellationToken,
    current: Option<Batch>,
}

impl DynamicBatcher {
    pub fn new(
        max_batch_size: usize,
        max_batch_latency: Duration,
        input: mpsc::Receiver<QueuedRequest>,
        output: mpsc::UnboundedSender<Batch>,
        token: CancellationToken,
    ) -> Self {
        Self {
            max_batch_size,
            max_batch_latency,
            input,
            output,
            token,
            current: None,
        }
    }

    pub async fn run(mut self) {
        info!(
            max_batch_size = self.max_batch_size,
            max_batch_latency_ms = self.max_batch_latency.as_millis() as u64,
            "Dynamic batcher started"
        );

        loop {
            match self.current.take() {
                None => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        item = self.input.recv() => match item {
                            Some(queued) => self.current = Some(Batch::new(queued)),
                            None => break,
                        },
                    }
                }
                Some(mut batch) => {
                    let deadline =
                        tokio::time::Instant::from_std(batch.created_at + self.max_batch_latency);
                    tokio::select! {
                        _ = self.token.cancelled() => {
                            self.flush(batch);
                            break;
                        }
                        _ = tokio::time::sleep_until(deadline) => self.flush(batch),
                        item = self.input.recv() => match item {
                            Some(queued) => {
                                batch.requests.push(queued);
                                if batch.size() >= self.max_batch_size {
                                    self.flush(batch);
                                } else {
                                    self.current = Some(batch);
                                }
                            }
                            None => {
                                self.flush(batch);
                                break;
                            }
                        },
                    }
                }
            }
        }

        if let Some(batch) = self.current.take() {
            self.flush(batch);
        }
        info!("Dynamic batcher stopped");
    }

    fn flush(&self, batch: Batch) {
        debug!(size = batch.size(), "Batch flushed");
        counter!("node_batches_emitted_total", 1);
        if let Err(rejected) = self.output.send(batch) {
            // Scheduler already gone: nothing downstream will complete these.
            rejected.0.fail(NodeError::ShuttingDown);
        }
    }
}
