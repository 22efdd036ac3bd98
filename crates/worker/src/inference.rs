//! Inference strategy supplied by the embedding application
//!
//! The worker treats inference as an opaque, synchronous, batch-in/batch-out
//! call. Outputs are paired with inputs by position, so a strategy must
//! return exactly one prediction per request, in order.

use crate::accumulator::Batch;
use anyinfer_common::{AnyInferError, Result};
use anyinfer_proto::{Request, Response};
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// Inference output for one request
pub type Prediction = Value;

/// Batch inference callable
pub trait InferenceStrategy: Send + Sync + 'static {
    /// Run inference on a batch, returning one prediction per request
    fn infer(&self, batch: &[Request]) -> anyhow::Result<Vec<Prediction>>;
}

/// Adapter turning a closure into an [`InferenceStrategy`]
pub struct FnInference<F>(F);

impl<F> InferenceStrategy for FnInference<F>
where
    F: Fn(&[Request]) -> anyhow::Result<Vec<Prediction>> + Send + Sync + 'static,
{
    fn infer(&self, batch: &[Request]) -> anyhow::Result<Vec<Prediction>> {
        (self.0)(batch)
    }
}

/// Wrap a closure as an inference strategy
pub fn from_fn<F>(f: F) -> FnInference<F>
where
    F: Fn(&[Request]) -> anyhow::Result<Vec<Prediction>> + Send + Sync + 'static,
{
    FnInference(f)
}

/// Run `strategy` on `batch` and check the output length
pub fn predict(strategy: &dyn InferenceStrategy, batch: &Batch) -> Result<Vec<Prediction>> {
    let start = Instant::now();

    let predictions = strategy
        .infer(batch.requests())
        .map_err(|e| AnyInferError::inference(format!("{:#}", e)))?;

    if predictions.len() != batch.len() {
        return Err(AnyInferError::BatchMismatch {
            expected: batch.len(),
            actual: predictions.len(),
        });
    }

    debug!(
        "Inference on {} requests took {:?}",
        batch.len(),
        start.elapsed()
    );

    Ok(predictions)
}

/// Merge each request with its prediction
pub fn pair(batch: Batch, predictions: Vec<Prediction>) -> Vec<Response> {
    batch
        .into_requests()
        .into_iter()
        .zip(predictions)
        .map(|(request, prediction)| Response::new(request, prediction))
        .collect()
}
