//! AnyInfer Worker
//!
//! Consumes inference requests from a broker, batches requests that arrive
//! close together, runs one inference call per batch and routes every result
//! back to the private queue of the client that sent it.

pub mod accumulator;
pub mod consumer;
pub mod dispatch;
pub mod inference;
pub mod publisher;

pub use accumulator::{Accumulator, Batch};
pub use consumer::BatchingWorker;
pub use dispatch::DrainTask;
pub use inference::{from_fn, InferenceStrategy, Prediction};
pub use publisher::{PublishHandle, PublisherPool};
