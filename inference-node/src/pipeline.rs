use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batcher::DynamicBatcher;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::model::{detect_gpu_count, ModelRunner};
use crate::queue::{QueuedRequest, RequestQueue};
use crate::scheduler::Scheduler;
use crate::worker::GpuWorker;
use serving_common::{InferenceRequest, InferenceResponse};

enum PipelineState {
    Created { request_rx: mpsc::Receiver<QueuedRequest> },
    Running(RunningPipeline),
    Stopped,
}

struct RunningPipeline {
    token: CancellationToken,
    batcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    scheduler: JoinHandle<()>,
}

/// Wires queue → batcher → scheduler → workers and owns their lifecycle.
///
/// `initialize` and `shutdown` are idempotent; shutdown cancels the shared
/// token and joins the stages in reverse construction order, after which
/// every outstanding handle has been completed with a result or an error.
pub struct InferencePipeline {
    config: NodeConfig,
    queue: RequestQueue,
    initialized: AtomicBool,
    state: Mutex<PipelineState>,
}

impl InferencePipeline {
    pub fn new(config: &NodeConfig) -> Self {
        let (queue, request_rx) = RequestQueue::new(config.max_in_flight_requests);
        Self {
            config: config.clone(),
            queue,
            initialized: AtomicBool::new(false),
            state: Mutex::new(PipelineState::Created { request_rx }),
        }
    }

    /// Number of workers: one per detected GPU, two in mock mode, and a
    /// single CPU-bound worker when no GPU is visible.
    fn worker_count(&self) -> usize {
        if self.config.use_mock_model {
            return 2;
        }
        detect_gpu_count().max(1)
    }

    pub async fn initialize(&self) {
        let mut state = self.state.lock().await;
        let request_rx = match std::mem::replace(&mut *state, PipelineState::Stopped) {
            PipelineState::Created { request_rx } => request_rx,
            running @ PipelineState::Running(_) => {
                *state = running;
                return;
            }
            PipelineState::Stopped => {
                warn!("initialize called on a stopped pipeline");
                return;
            }
        };

        let worker_count = self.worker_count();
        info!(worker_count, "Initializing inference pipeline");

        let token = CancellationToken::new();
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let batcher = DynamicBatcher::new(
            self.config.batch_max_size,
            self.config.batch_max_latency(),
            request_rx,
            batch_tx.clone(),
            token.clone(),
        );
        let batcher_task = tokio::spawn(batcher.run());

        let mut handles = Vec::with_capacity(worker_count);
        let mut worker_tasks = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let model = Arc::new(ModelRunner::load(worker_id, self.config.use_mock_model));
            let (handle, worker) = GpuWorker::new(worker_id, worker_id, model, token.clone());
            handles.push(handle);
            worker_tasks.push(tokio::spawn(worker.run()));
        }

        let scheduler = Scheduler::new(handles, batch_rx, batch_tx, token.clone());
        let scheduler_task = tokio::spawn(scheduler.run());

        *state = PipelineState::Running(RunningPipeline {
            token,
            batcher: batcher_task,
            workers: worker_tasks,
            scheduler: scheduler_task,
        });
        self.initialized.store(true, Ordering::Release);
        info!("Inference pipeline initialized");
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, PipelineState::Stopped) {
            PipelineState::Running(running) => {
                info!("Shutting down inference pipeline");
                running.token.cancel();
                let _ = running.scheduler.await;
                for worker in running.workers.into_iter().rev() {
                    let _ = worker.await;
                }
                let _ = running.batcher.await;
                info!("Inference pipeline stopped");
            }
            // Dropping the never-consumed receiver closes the queue, so any
            // later submit completes with a shutdown error.
            PipelineState::Created { .. } | PipelineState::Stopped => {}
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// Admit one request and wait for its completion handle.
    pub async fn submit(
        &self,
        request: InferenceRequest,
        request_id: String,
    ) -> Result<InferenceResponse, NodeError> {
        if !self.initialized.load(Ordering::Acquire) {
            self.initialize().await;
        }
        let receiver = self.queue.submit(request, request_id);
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Cancelled),
        }
    }
}
