//! Batching worker loop
//!
//! The worker receives requests from the shared input queue, copies each one
//! into the accumulator, acknowledges it, and schedules a drain task when
//! fewer than `consume_workers` drains are running. Once the pool is
//! saturated, requests keep accumulating and are picked up by the running
//! drains.

use crate::accumulator::Accumulator;
use crate::dispatch::DrainTask;
use crate::inference::InferenceStrategy;
use crate::publisher::{PublishHandle, PublisherPool};
use anyinfer_broker::{Broker, Connection, Delivery, QueueSpec, Subscription};
use anyinfer_common::config::AnyInferConfig;
use anyinfer_common::{AnyInferError, Backoff, Result, METRICS};
use anyinfer_proto::Request;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Consumer that batches requests from the input queue
pub struct BatchingWorker {
    id: Arc<str>,
    broker: Arc<dyn Broker>,
    config: AnyInferConfig,
    accumulator: Arc<Accumulator>,
    inference: Arc<dyn InferenceStrategy>,
}

/// What the receive loop ended with
enum LoopExit {
    Shutdown,
    Fatal(AnyInferError),
}

impl BatchingWorker {
    /// Create a worker; its identifier is resolved once from the configuration
    pub fn new<S: InferenceStrategy>(
        broker: Arc<dyn Broker>,
        config: AnyInferConfig,
        inference: S,
    ) -> Self {
        let id: Arc<str> = Arc::from(config.worker.resolve_instance_id());
        Self {
            id,
            broker,
            config,
            accumulator: Arc::new(Accumulator::new()),
            inference: Arc::new(inference),
        }
    }

    /// Worker identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests waiting to be batched
    pub fn pending(&self) -> usize {
        self.accumulator.len()
    }

    /// Run until Ctrl-C
    pub async fn spin(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await
    }

    /// Run until `shutdown` completes, then drain in-flight work
    ///
    /// Returns an error when the configuration is invalid or the broker stays
    /// unreachable for longer than the retry policy allows.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.config.validate()?;

        let publisher = PublisherPool::start(
            self.broker.clone(),
            self.config.broker.outputs_exchange.clone(),
            self.config.worker.publish_workers,
        )
        .await?;

        info!(
            "Worker {} consuming {:?} (max_batch={}, wait_ms={}, consume_workers={}, publish_workers={})",
            self.id,
            self.config.broker.inputs_queue,
            self.config.worker.max_batch,
            self.config.worker.wait_ms,
            self.config.worker.consume_workers,
            self.config.worker.publish_workers
        );

        let mut drains = JoinSet::new();
        let exit = self
            .receive_loop(publisher.handle(), &mut drains, shutdown)
            .await;

        info!(
            "Worker {} stopping, waiting for {} drain tasks",
            self.id,
            drains.len()
        );
        while let Some(joined) = drains.join_next().await {
            report(&self.id, joined);
        }
        METRICS.worker.inflight_drains.set(0);
        publisher.shutdown().await;
        info!("Worker {} shutdown complete", self.id);

        match exit {
            LoopExit::Shutdown => Ok(()),
            LoopExit::Fatal(e) => Err(e),
        }
    }

    async fn receive_loop<F>(
        &self,
        publisher: PublishHandle,
        drains: &mut JoinSet<usize>,
        shutdown: F,
    ) -> LoopExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff = Backoff::new(self.config.broker.retry.clone());
        let poll_interval = self.config.broker.poll_interval();

        loop {
            let (_connection, mut subscription) = tokio::select! {
                _ = &mut shutdown => return LoopExit::Shutdown,
                opened = self.open() => match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        if let Some(exit) = self.retry(e, &mut backoff, &mut shutdown).await {
                            return exit;
                        }
                        continue;
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = &mut shutdown => return LoopExit::Shutdown,
                    next = subscription.next(Some(poll_interval)) => match next {
                        Ok(Some(delivery)) => {
                            backoff.reset();
                            self.on_delivery(delivery, &publisher, drains);
                        }
                        Ok(None) => {
                            backoff.reset();
                            // Pick up requests left behind by a drain that was finishing.
                            self.schedule(&publisher, drains, 1);
                        }
                        Err(e) => {
                            if let Some(exit) = self.retry(e, &mut backoff, &mut shutdown).await {
                                return exit;
                            }
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn open(&self) -> Result<(Box<dyn Connection>, Box<dyn Subscription>)> {
        let connection = self.broker.connect().await?;
        let spec = QueueSpec::new(self.config.broker.inputs_queue.clone())
            .with_limits(&self.config.inputs);
        connection.declare_queue(&spec).await?;
        let subscription = connection.subscribe(&spec.name).await?;
        Ok((connection, subscription))
    }

    /// Log a transport error and back off; `Some` when the loop must stop
    async fn retry<F>(
        &self,
        error: AnyInferError,
        backoff: &mut Backoff,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> Option<LoopExit>
    where
        F: Future<Output = ()>,
    {
        METRICS.worker.transport_errors.inc();
        warn!(
            "[{}] Transport error (attempt {}): {}",
            self.id,
            backoff.attempts() + 1,
            error
        );

        if !error.is_transient() && !matches!(error, AnyInferError::NotFound(_)) {
            return Some(LoopExit::Fatal(error));
        }

        tokio::select! {
            _ = shutdown.as_mut() => Some(LoopExit::Shutdown),
            retrying = backoff.wait() => {
                if retrying {
                    None
                } else {
                    error!(
                        "[{}] Giving up on broker after {} attempts",
                        self.id,
                        backoff.attempts()
                    );
                    Some(LoopExit::Fatal(AnyInferError::RetriesExhausted {
                        attempts: backoff.attempts(),
                        last_error: error.to_string(),
                    }))
                }
            }
        }
    }

    fn on_delivery(
        &self,
        delivery: Delivery,
        publisher: &PublishHandle,
        drains: &mut JoinSet<usize>,
    ) {
        let request = match Request::from_slice(delivery.body()) {
            Ok(request) => request,
            Err(e) => {
                METRICS.worker.messages_rejected.inc();
                warn!("[{}] Rejecting message: {}", self.id, e);
                if let Err(e) = delivery.reject(false) {
                    warn!("[{}] Reject failed: {}", self.id, e);
                }
                return;
            }
        };

        debug!("[{}] {} -> {}", self.id, request.pid, request.uid);
        self.accumulator.push(request);
        if let Err(e) = delivery.ack() {
            warn!("[{}] Ack failed, message may be redelivered: {}", self.id, e);
        }
        METRICS.worker.messages_received.inc();
        METRICS.worker.pending_requests.set(self.accumulator.len() as i64);

        self.schedule(publisher, drains, self.config.worker.consume_workers);
    }

    /// Start a drain task for pending requests while fewer than `slots` run
    fn schedule(&self, publisher: &PublishHandle, drains: &mut JoinSet<usize>, slots: usize) {
        reap(&self.id, drains);
        if self.accumulator.is_empty() {
            return;
        }

        if drains.len() < slots.min(self.config.worker.consume_workers) {
            drains.spawn(
                DrainTask::new(
                    self.id.clone(),
                    self.accumulator.clone(),
                    self.inference.clone(),
                    publisher.clone(),
                    self.config.worker.max_batch,
                    self.config.worker.wait(),
                )
                .run(),
            );
        } else {
            trace!("[{}] All drain slots busy, request stays pending", self.id);
        }
        METRICS.worker.inflight_drains.set(drains.len() as i64);
    }
}

fn reap(worker_id: &str, drains: &mut JoinSet<usize>) {
    while let Some(joined) = drains.try_join_next() {
        report(worker_id, joined);
    }
    METRICS.worker.inflight_drains.set(drains.len() as i64);
}

fn report(worker_id: &str, joined: std::result::Result<usize, tokio::task::JoinError>) {
    match joined {
        Ok(dispatched) => trace!("[{}] Drain task finished, {} results", worker_id, dispatched),
        Err(e) => error!("[{}] Drain task failed: {}", worker_id, e),
    }
}
