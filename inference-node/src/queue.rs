use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::NodeError;
use serving_common::{InferenceRequest, InferenceResponse};

/// The outcome slot for one admitted request.
pub type CompletionResult = Result<InferenceResponse, NodeError>;

/// Single-shot completion slot carried by a queued request.
///
/// `complete` consumes the handle, so each request is signalled at most once;
/// dropping the handle without completing wakes the waiter with a
/// cancellation error instead of hanging it.
#[derive(Debug)]
pub struct CompletionHandle {
    sender: oneshot::Sender<CompletionResult>,
}

impl CompletionHandle {
    pub fn complete(self, result: CompletionResult) {
        // The waiter may have gone away (client disconnect); that is fine.
        let _ = self.sender.send(result);
    }
}

/// One admitted inference request flowing through the pipeline.
#[derive(Debug)]
pub struct QueuedRequest {
    pub request: InferenceRequest,
    pub request_id: String,
    pub completion: CompletionHandle,
}

impl QueuedRequest {
    pub fn new(
        request: InferenceRequest,
        request_id: String,
    ) -> (Self, oneshot::Receiver<CompletionResult>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                request,
                request_id,
                completion: CompletionHandle { sender },
            },
            receiver,
        )
    }

    pub fn complete(self, result: CompletionResult) {
        self.completion.complete(result);
    }
}

/// Admission side of the bounded request queue.
///
/// The receiving half is owned by the batcher; when the channel is full the
/// returned handle is already completed with a queue-full error, which the
/// HTTP layer surfaces as 429.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    sender: mpsc::Sender<QueuedRequest>,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedRequest>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Admit one request, returning the receiver its outcome arrives on.
    pub fn submit(
        &self,
        request: InferenceRequest,
        request_id: String,
    ) -> oneshot::Receiver<CompletionResult> {
        let (queued, receiver) = QueuedRequest::new(request, request_id);
        match self.sender.try_send(queued) {
            Ok(()) => {
                debug!("Request enqueued");
            }
            Err(mpsc::error::TrySendError::Full(rejected)) => {
                warn!(request_id = %rejected.request_id, "Request rejected: queue full");
                metrics::counter!("node_queue_rejections_total", 1);
                rejected.complete(Err(NodeError::QueueFull));
            }
            Err(mpsc::error::TrySendError::Closed(rejected)) => {
                warn!(request_id = %rejected.request_id, "Request rejected: pipeline stopped");
                rejected.complete(Err(NodeError::ShuttingDown));
            }
        }
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> InferenceRequest {
        InferenceRequest::new(prompt)
    }

    #[tokio::test]
    async fn submitted_request_reaches_consumer() {
        let (queue, mut receiver) = RequestQueue::new(4);
        let _pending = queue.submit(request("hello"), "req-0".to_string());

        let queued = receiver.recv().await.unwrap();
        assert_eq!(queued.request.prompt, "hello");
        assert_eq!(queued.request_id, "req-0");
    }

    #[tokio::test]
    async fn overflow_completes_handle_with_queue_full() {
        let (queue, _receiver) = RequestQueue::new(2);
        let _first = queue.submit(request("one"), "req-1".to_string());
        let _second = queue.submit(request("two"), "req-2".to_string());

        let third = queue.submit(request("three"), "req-3".to_string());
        let outcome = third.await.unwrap();
        assert_eq!(outcome.unwrap_err(), NodeError::QueueFull);
    }

    #[tokio::test]
    async fn closed_queue_completes_handle_with_shutdown() {
        let (queue, receiver) = RequestQueue::new(2);
        drop(receiver);

        let pending = queue.submit(request("late"), "req-9".to_string());
        let outcome = pending.await.unwrap();
        assert_eq!(outcome.unwrap_err(), NodeError::ShuttingDown);
    }

    #[tokio::test]
    async fn completion_fires_exactly_once() {
        let (queued, receiver) = QueuedRequest::new(request("hi"), "req-0".to_string());
        queued.complete(Ok(InferenceResponse {
            api_version: "v1".to_string(),
            text: "done".to_string(),
            request_id: "req-0".to_string(),
        }));

        let outcome = receiver.await.unwrap().unwrap();
        assert_eq!(outcome.text, "done");
    }

    #[tokio::test]
    async fn dropped_request_wakes_waiter_with_error() {
        let (queued, receiver) = QueuedRequest::new(request("hi"), "req-0".to_string());
        drop(queued);
        assert!(receiver.await.is_err());
    }
}
