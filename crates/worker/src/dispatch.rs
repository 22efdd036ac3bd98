//! Drain-and-dispatch task
//!
//! One task debounces, drains a bounded batch from the accumulator, runs
//! inference while holding the accumulator's inference guard, then hands every
//! result to the publisher pool without waiting for it to be sent. A failed
//! batch is logged and dropped; nothing is published for it.

use crate::accumulator::Accumulator;
use crate::inference::{self, InferenceStrategy};
use crate::publisher::PublishHandle;
use anyinfer_common::{LatencyTimer, METRICS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// A scheduled drain attempt
pub struct DrainTask {
    worker_id: Arc<str>,
    accumulator: Arc<Accumulator>,
    inference: Arc<dyn InferenceStrategy>,
    publisher: PublishHandle,
    max_batch: usize,
    wait: Duration,
}

impl DrainTask {
    pub fn new(
        worker_id: Arc<str>,
        accumulator: Arc<Accumulator>,
        inference: Arc<dyn InferenceStrategy>,
        publisher: PublishHandle,
        max_batch: usize,
        wait: Duration,
    ) -> Self {
        Self {
            worker_id,
            accumulator,
            inference,
            publisher,
            max_batch,
            wait,
        }
    }

    /// Drain until the accumulator is empty; returns the number of results dispatched
    ///
    /// Requests that arrive while every drain slot is busy are picked up by
    /// the next round of a running task instead of waiting for a new message.
    pub async fn run(self) -> usize {
        trace!("[{}] drain task started", self.worker_id);
        let mut dispatched = 0;

        loop {
            if !self.wait.is_zero() {
                tokio::time::sleep(self.wait).await;
            }

            dispatched += self.drain_once().await;

            if self.accumulator.is_empty() {
                break;
            }
        }

        METRICS.worker.pending_requests.set(self.accumulator.len() as i64);
        dispatched
    }

    /// Drain one batch, infer and submit its results
    pub async fn drain_once(&self) -> usize {
        let accumulator = self.accumulator.clone();
        let strategy = self.inference.clone();
        let limit = self.max_batch;

        let outcome = tokio::task::spawn_blocking(move || {
            accumulator.drain_with(limit, |batch| {
                if batch.is_empty() {
                    return Ok(Vec::new());
                }
                METRICS
                    .worker
                    .inference_duration
                    .observe_closure(|| inference::predict(strategy.as_ref(), batch))
            })
        })
        .await;

        let (batch, predictions) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                METRICS.worker.inference_failures.inc();
                error!("[{}] Inference task failed, batch dropped: {}", self.worker_id, e);
                return 0;
            }
        };

        if batch.is_empty() {
            debug!("[{}] Nothing to batch", self.worker_id);
            return 0;
        }

        let predictions = match predictions {
            Ok(predictions) => predictions,
            Err(e) => {
                METRICS.worker.inference_failures.inc();
                error!(
                    "[{}] Inference failed, dropping batch of {} ({}): {}",
                    self.worker_id,
                    batch.len(),
                    batch.uids().join(","),
                    e
                );
                return 0;
            }
        };

        let size = batch.len();
        METRICS.worker.batches_total.inc();
        METRICS.worker.batch_size.observe(size as f64);
        info!(
            "[{}] Batched {} requests: {}",
            self.worker_id,
            size,
            batch.uids().join(",")
        );

        let mut dispatched = 0;
        for response in inference::pair(batch, predictions) {
            match self.publisher.submit(response) {
                Ok(()) => dispatched += 1,
                Err(e) => warn!("[{}] Result not submitted: {}", self.worker_id, e),
            }
        }

        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::from_fn;
    use crate::publisher::PublisherPool;
    use anyinfer_broker::{Broker, MemoryBroker, QueueSpec};
    use anyinfer_proto::{Request, Response};
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        broker: MemoryBroker,
        accumulator: Arc<Accumulator>,
        pool: PublisherPool,
        _observer: Box<dyn anyinfer_broker::Connection>,
    }

    async fn fixture() -> Fixture {
        let broker = MemoryBroker::new();
        let observer = broker.connect().await.unwrap();
        observer
            .declare_queue(&QueueSpec::new("client").bind("outputs", "client"))
            .await
            .unwrap();
        let pool = PublisherPool::start(Arc::new(broker.clone()), "outputs", 2)
            .await
            .unwrap();

        Fixture {
            broker,
            accumulator: Arc::new(Accumulator::new()),
            pool,
            _observer: observer,
        }
    }

    fn task(
        fixture: &Fixture,
        inference: Arc<dyn InferenceStrategy>,
        max_batch: usize,
    ) -> DrainTask {
        DrainTask::new(
            Arc::from("test-worker"),
            fixture.accumulator.clone(),
            inference,
            fixture.pool.handle(),
            max_batch,
            Duration::ZERO,
        )
    }

    fn push(accumulator: &Accumulator, uid: &str, fields: serde_json::Value) {
        let fields: Map<String, serde_json::Value> = serde_json::from_value(fields).unwrap();
        accumulator.push(Request::new(uid, "client", fields));
    }

    #[tokio::test]
    async fn test_drain_once_publishes_results() {
        let fixture = fixture().await;
        push(&fixture.accumulator, "a", json!({"x": 1}));
        push(&fixture.accumulator, "b", json!({"x": 2}));
        push(&fixture.accumulator, "c", json!({"x": 3}));

        let doubler = Arc::new(from_fn(|batch: &[Request]| {
            Ok(batch
                .iter()
                .map(|r| json!(r.get("x").and_then(|x| x.as_i64()).unwrap_or(0) * 2))
                .collect())
        }));

        let drain = task(&fixture, doubler, 2);
        assert_eq!(drain.drain_once().await, 2);
        assert_eq!(fixture.accumulator.len(), 1);
        drop(drain);

        let Fixture { broker, pool, _observer: observer, .. } = fixture;
        pool.shutdown().await;
        assert_eq!(broker.queue_depth("client"), Some(2));

        let mut subscription = observer.subscribe("client").await.unwrap();
        let poll = Some(Duration::from_millis(10));
        while let Some(delivery) = subscription.next(poll).await.unwrap() {
            let response = Response::from_slice(delivery.body()).unwrap();
            let x = response.get("x").and_then(|x| x.as_i64()).unwrap();
            assert_eq!(response.prediction, json!(x * 2));
            delivery.ack().unwrap();
        }
    }

    #[tokio::test]
    async fn test_run_drains_everything() {
        let fixture = fixture().await;
        for i in 0..5 {
            push(&fixture.accumulator, &format!("req-{}", i), json!({}));
        }

        let echo = Arc::new(from_fn(|batch: &[Request]| {
            Ok(batch.iter().map(|r| json!(r.uid)).collect())
        }));

        let dispatched = task(&fixture, echo, 2).run().await;
        assert_eq!(dispatched, 5);
        assert!(fixture.accumulator.is_empty());

        fixture.pool.shutdown().await;
        assert_eq!(fixture.broker.queue_depth("client"), Some(5));
    }

    #[tokio::test]
    async fn test_failed_inference_publishes_nothing() {
        let fixture = fixture().await;
        push(&fixture.accumulator, "poison", json!({"fail": true}));

        let failing = Arc::new(from_fn(|batch: &[Request]| {
            if batch.iter().any(|r| r.get("fail").is_some()) {
                anyhow::bail!("cannot handle poison request");
            }
            Ok(batch.iter().map(|_| json!(null)).collect())
        }));

        assert_eq!(task(&fixture, failing, 4).run().await, 0);
        assert!(fixture.accumulator.is_empty());

        fixture.pool.shutdown().await;
        assert_eq!(fixture.broker.queue_depth("client"), Some(0));
    }

    #[tokio::test]
    async fn test_mismatched_output_publishes_nothing() {
        let fixture = fixture().await;
        push(&fixture.accumulator, "a", json!({}));
        push(&fixture.accumulator, "b", json!({}));

        let short = Arc::new(from_fn(|_batch: &[Request]| Ok(vec![json!(1)])));

        assert_eq!(task(&fixture, short, 4).drain_once().await, 0);

        fixture.pool.shutdown().await;
        assert_eq!(fixture.broker.queue_depth("client"), Some(0));
    }

    #[tokio::test]
    async fn test_panicking_inference_is_contained() {
        let fixture = fixture().await;
        push(&fixture.accumulator, "a", json!({}));

        let panicking = Arc::new(from_fn(
            |_batch: &[Request]| -> anyhow::Result<Vec<serde_json::Value>> {
                panic!("inference bug")
            },
        ));

        assert_eq!(task(&fixture, panicking, 4).drain_once().await, 0);
        assert!(fixture.accumulator.is_empty());
        fixture.pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inference_never_overlaps() {
        let fixture = fixture().await;
        for i in 0..24 {
            push(&fixture.accumulator, &format!("req-{}", i), json!({}));
        }

        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = {
            let running = running.clone();
            let max_running = max_running.clone();
            let calls = calls.clone();
            Arc::new(from_fn(move |batch: &[Request]| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(batch.iter().map(|_| json!(true)).collect())
            }))
        };

        let tasks: Vec<_> = (0..4)
            .map(|_| tokio::spawn(task(&fixture, strategy.clone(), 3).run()))
            .collect();

        let mut dispatched = 0;
        for handle in tasks {
            dispatched += handle.await.unwrap();
        }

        assert_eq!(dispatched, 24);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(calls.load(Ordering::SeqCst) >= 8);

        fixture.pool.shutdown().await;
    }
}
