use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::batcher::Batch;
use crate::error::NodeError;
use crate::model::ModelRunner;
use crate::queue::QueuedRequest;
use crate::scheduler::WorkerHandle;
use serving_common::{InferenceResponse, API_VERSION};

/// Executes batches on one GPU.
///
/// The availability flag is cleared for the whole batch; each member's
/// `generate` runs on the blocking pool so the async runtime keeps making
/// progress. A generate failure completes only that member's handle.
pub struct GpuWorker {
    worker_id: usize,
    gpu_id: usize,
    model: Arc<ModelRunner>,
    available: Arc<AtomicBool>,
    input: mpsc::UnboundedReceiver<Batch>,
    token: CancellationToken,
}

impl GpuWorker {
    pub fn new(
        worker_id: usize,
        gpu_id: usize,
        model: Arc<ModelRunner>,
        token: CancellationToken,
    ) -> (WorkerHandle, Self) {
        let (sender, input) = mpsc::unbounded_channel();
        let available = Arc::new(AtomicBool::new(true));
        let handle = WorkerHandle::new(worker_id, Arc::clone(&available), sender);
        (
            handle,
            Self {
                worker_id,
                gpu_id,
                model,
                available,
                input,
                token,
            },
        )
    }

    pub async fn run(mut self) {
        info!(
            worker_id = self.worker_id,
            gpu_id = self.gpu_id,
            device = self.model.device(),
            "GPU worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                batch = self.input.recv() => {
                    let Some(batch) = batch else { break };
                    self.process_batch(batch).await;
                }
            }
        }

        // Drain whatever the scheduler already handed over.
        self.input.close();
        while let Ok(batch) = self.input.try_recv() {
            batch.fail(NodeError::ShuttingDown);
        }
        info!(worker_id = self.worker_id, "GPU worker stopped");
    }

    async fn process_batch(&mut self, batch: Batch) {
        self.available.store(false, Ordering::Release);
        debug!(
            worker_id = self.worker_id,
            size = batch.size(),
            "Processing batch"
        );

        for queued in batch.requests {
            let QueuedRequest {
                request,
                request_id,
                completion,
            } = queued;

            let model = Arc::clone(&self.model);
            let prompt = request.prompt;
            let max_tokens = request.max_tokens;
            let temperature = request.temperature;
            let result = tokio::task::spawn_blocking(move || {
                model.generate(&prompt, max_tokens, temperature)
            })
            .await;

            match result {
                Ok(Ok(text)) => {
                    completion.complete(Ok(InferenceResponse {
                        api_version: API_VERSION.to_string(),
                        text,
                        request_id,
                    }));
                }
                Ok(Err(err)) => {
                    error!(
                        worker_id = self.worker_id,
                        request_id = %request_id,
                        error = %err,
                        "Generation failed"
                    );
                    completion.complete(Err(err));
                }
                Err(join_err) => {
                    error!(
                        worker_id = self.worker_id,
                        request_id = %request_id,
                        error = %join_err,
                        "Generation task panicked"
                    );
                    completion.complete(Err(NodeError::Generate(join_err.to_string())));
                }
            }
        }

        self.available.store(true, Ordering::Release);
    }
}
