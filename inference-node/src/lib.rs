//! Inference node library.
//!
//! Serves single inference calls through a dynamic-batching pipeline: a
//! bounded admission queue feeds a size-or-latency batcher, a scheduler
//! assigns sealed batches to idle GPU workers, and each request completes
//! through its own single-shot handle. A registry client keeps the node's
//! gateway membership alive.

pub mod api;
pub mod batcher;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod registry_client;
pub mod scheduler;
pub mod worker;

// Re-export commonly used types
pub use api::{create_api_router, AppState};
pub use batcher::{Batch, DynamicBatcher};
pub use config::NodeConfig;
pub use error::NodeError;
pub use model::ModelRunner;
pub use pipeline::InferencePipeline;
pub use queue::{CompletionHandle, QueuedRequest, RequestQueue};
pub use registry_client::RegistryClient;
pub use scheduler::{Scheduler, WorkerHandle};
pub use worker::GpuWorker;
