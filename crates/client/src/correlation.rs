//! Request/response correlation over the broker
//!
//! Every request is stamped with a fresh `uid` and the client's own id as
//! `pid`, then published to the shared input queue. Workers publish results
//! to the client's private output queue. One listener task per client reads
//! that queue and completes the matching entry of the pending table, so any
//! number of `send` calls can be in flight on the same client.

use crate::pending::PendingTable;
use anyinfer_broker::{Broker, Connection, Delivery, QueueSpec, Subscription, DEFAULT_EXCHANGE};
use anyinfer_common::config::{AnyInferConfig, RetryConfig};
use anyinfer_common::{AnyInferError, Backoff, Result, METRICS};
use anyinfer_proto::{Request, Response};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct ClientInner {
    id: String,
    connection: Box<dyn Connection>,
    inputs_queue: String,
    wait_timeout: Duration,
    pending: PendingTable,
}

/// Client side of the request/response protocol
pub struct CorrelationClient {
    inner: Arc<ClientInner>,
    listener: JoinHandle<()>,
}

impl CorrelationClient {
    /// Connect, declare the input queue and this client's private output queue,
    /// and start the response listener
    pub async fn connect(broker: &dyn Broker, config: &AnyInferConfig) -> Result<Self> {
        config.validate()?;
        let wait_timeout = config.client.wait_timeout()?;
        let id = config.client.resolve_instance_id();
        let connection = broker.connect().await?;

        let inputs =
            QueueSpec::new(config.broker.inputs_queue.clone()).with_limits(&config.inputs);
        connection.declare_queue(&inputs).await?;

        let outputs = QueueSpec::new(id.clone())
            .with_limits(&config.outputs)
            .exclusive()
            .bind(config.broker.outputs_exchange.clone(), id.clone());
        connection.declare_queue(&outputs).await?;
        let subscription = connection.subscribe(&id).await?;

        let inner = Arc::new(ClientInner {
            id,
            connection,
            inputs_queue: config.broker.inputs_queue.clone(),
            wait_timeout,
            pending: PendingTable::new(),
        });

        let listener = tokio::spawn(listen(
            inner.clone(),
            subscription,
            config.broker.retry.clone(),
        ));

        info!(
            "Client {} connected to {} (wait_timeout={:?})",
            inner.id, config.broker.url, inner.wait_timeout
        );

        Ok(Self { inner, listener })
    }

    /// Client identifier, also the routing key of its output queue
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Maximum time `send` waits for an answer
    pub fn wait_timeout(&self) -> Duration {
        self.inner.wait_timeout
    }

    /// Requests currently awaiting a response
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send `data` for inference and wait for its result
    ///
    /// Fails with [`AnyInferError::Timeout`] when no matching response arrives
    /// within the wait timeout, and with a transport error when the request
    /// could not be published or the listener stopped.
    pub async fn send(&self, data: Map<String, Value>) -> Result<Response> {
        if self.listener.is_finished() {
            return Err(AnyInferError::transport(format!(
                "response listener of {} stopped",
                self.inner.id
            )));
        }

        let uid = Uuid::new_v4().to_string();
        let request = Request::new(uid.clone(), self.inner.id.clone(), data);
        let body = request.to_bytes()?;

        let receiver = self.inner.pending.register(&uid);
        let started = Instant::now();

        if let Err(e) = self
            .inner
            .connection
            .publish(DEFAULT_EXCHANGE, &self.inner.inputs_queue, body)
            .await
        {
            self.inner.pending.cancel(&uid);
            return Err(e);
        }
        METRICS.client.requests_sent.inc();
        debug!("[{}] sent {}", self.inner.id, uid);

        match tokio::time::timeout(self.inner.wait_timeout, receiver).await {
            Ok(Ok(response)) => {
                METRICS
                    .client
                    .round_trip_duration
                    .observe(started.elapsed().as_secs_f64());
                Ok(response)
            }
            Ok(Err(_)) => Err(AnyInferError::transport(format!(
                "response listener of {} stopped",
                self.inner.id
            ))),
            Err(_) => {
                self.inner.pending.cancel(&uid);
                METRICS.client.timeouts.inc();
                Err(AnyInferError::timeout(format!(
                    "Output(uid={}) not received in time",
                    uid
                )))
            }
        }
    }

    /// Send a JSON object
    pub async fn send_json(&self, data: Value) -> Result<Response> {
        match data {
            Value::Object(map) => self.send(map).await,
            other => Err(AnyInferError::malformed(format!(
                "request must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Stop the listener and release the connection
    pub async fn close(mut self) {
        self.listener.abort();
        let _ = (&mut self.listener).await;
        debug!("Client {} closed", self.inner.id);
    }
}

impl Drop for CorrelationClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    inner: Arc<ClientInner>,
    mut subscription: Box<dyn Subscription>,
    retry: RetryConfig,
) {
    let mut backoff = Backoff::new(retry);

    loop {
        match subscription.next(None).await {
            Ok(Some(delivery)) => {
                backoff.reset();
                route(&inner, delivery);
            }
            Ok(None) => continue,
            Err(AnyInferError::NotFound(e)) => {
                warn!("[{}] Output queue gone, listener stopped: {}", inner.id, e);
                break;
            }
            Err(e) => {
                warn!("[{}] Response listener error: {}", inner.id, e);
                if !backoff.wait().await {
                    warn!(
                        "[{}] Response listener giving up after {} attempts",
                        inner.id,
                        backoff.attempts()
                    );
                    break;
                }
                match inner.connection.subscribe(&inner.id).await {
                    Ok(resubscribed) => subscription = resubscribed,
                    Err(e) => trace!("[{}] Resubscribe failed: {}", inner.id, e),
                }
            }
        }
    }

    inner.pending.close_all();
}

fn route(inner: &ClientInner, delivery: Delivery) {
    let response = match Response::from_slice(delivery.body()) {
        Ok(response) => response,
        Err(e) => {
            warn!("[{}] Discarding response: {}", inner.id, e);
            if let Err(e) = delivery.reject(false) {
                warn!("[{}] Reject failed: {}", inner.id, e);
            }
            return;
        }
    };

    let uid = response.uid().to_string();
    if inner.pending.complete(response) {
        METRICS.client.responses_received.inc();
        debug!("[{}] received {}", inner.id, uid);
    } else {
        METRICS.client.orphaned_responses.inc();
        debug!("[{}] no one waiting for {}, discarded", inner.id, uid);
    }

    if let Err(e) = delivery.ack() {
        warn!("[{}] Ack failed for {}: {}", inner.id, uid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyinfer_broker::MemoryBroker;
    use serde_json::json;

    fn config(timeout_secs: f64) -> AnyInferConfig {
        let mut config = AnyInferConfig::default();
        config.client.wait_timeout_secs = timeout_secs;
        config.inputs.max_length = Some(256);
        config.outputs.max_length = Some(256);
        config
    }

    /// Answers every request on the input queue with `prediction = x * 10`
    async fn responder(broker: MemoryBroker) -> JoinHandle<()> {
        let connection = broker.connect().await.unwrap();
        connection
            .declare_queue(&QueueSpec::new("inputs").with_limits(&config(1.0).inputs))
            .await
            .unwrap();
        let mut subscription = connection.subscribe("inputs").await.unwrap();

        tokio::spawn(async move {
            while let Ok(Some(delivery)) = subscription.next(None).await {
                let request = Request::from_slice(delivery.body()).unwrap();
                delivery.ack().unwrap();
                let x = request.get("x").and_then(|x| x.as_i64()).unwrap_or(0);
                let pid = request.pid.clone();
                let response = Response::new(request, json!(x * 10));
                connection
                    .publish("outputs", &pid, response.to_bytes().unwrap())
                    .await
                    .unwrap();
            }
        })
    }

    #[tokio::test]
    async fn test_round_trip() {
        let broker = MemoryBroker::new();
        let _responder = responder(broker.clone()).await;
        let client = CorrelationClient::connect(&broker, &config(2.0)).await.unwrap();

        let response = client.send_json(json!({"x": 1})).await.unwrap();

        assert_eq!(response.get("x"), Some(&json!(1)));
        assert_eq!(response.pid(), client.id());
        assert_eq!(response.prediction, json!(10));
        assert!(Uuid::parse_str(response.uid()).is_ok());
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_get_their_own_answers() {
        let broker = MemoryBroker::new();
        let _responder = responder(broker.clone()).await;
        let client = Arc::new(CorrelationClient::connect(&broker, &config(2.0)).await.unwrap());

        let calls: Vec<_> = (0..20)
            .map(|x| {
                let client = client.clone();
                tokio::spawn(async move { (x, client.send_json(json!({"x": x})).await) })
            })
            .collect();

        for call in calls {
            let (x, response) = call.await.unwrap();
            let response = response.unwrap();
            assert_eq!(response.get("x"), Some(&json!(x)));
            assert_eq!(response.prediction, json!(x * 10));
        }
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_timeout_without_worker() {
        let broker = MemoryBroker::new();
        let client = CorrelationClient::connect(&broker, &config(0.2)).await.unwrap();

        let started = Instant::now();
        let err = client.send_json(json!({"x": 1})).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, AnyInferError::Timeout(_)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(1000));
        assert_eq!(client.pending(), 0);
        assert_eq!(broker.queue_depth("inputs"), Some(1));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_a_timeout() {
        let broker = MemoryBroker::new();
        let client = CorrelationClient::connect(&broker, &config(1.0)).await.unwrap();
        broker.set_online(false);

        let err = client.send_json(json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, AnyInferError::Transport(_)));
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_late_response_is_discarded() {
        let broker = MemoryBroker::new();
        let client = CorrelationClient::connect(&broker, &config(0.1)).await.unwrap();
        let err = client.send_json(json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, AnyInferError::Timeout(_)));

        let late = Response::new(Request::new("stale-uid", client.id(), Map::new()), json!(0));
        let connection = broker.connect().await.unwrap();
        connection
            .publish("outputs", client.id(), late.to_bytes().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.queue_depth(client.id()), Some(0));
        assert_eq!(broker.unacked_count(client.id()), Some(0));
    }

    #[tokio::test]
    async fn test_send_json_rejects_non_objects() {
        let broker = MemoryBroker::new();
        let client = CorrelationClient::connect(&broker, &config(1.0)).await.unwrap();

        let err = client.send_json(json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, AnyInferError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_timeout() {
        let broker = MemoryBroker::new();

        for timeout in [-1.0, 0.0, f64::NAN] {
            let result = CorrelationClient::connect(&broker, &config(timeout)).await;
            assert!(matches!(result, Err(AnyInferError::Config(_))));
        }
        assert!(!broker.queue_exists("inputs"));
    }

    #[tokio::test]
    async fn test_close_removes_output_queue() {
        let broker = MemoryBroker::new();
        let mut config = config(1.0);
        config.client.instance_id = Some("client-close".to_string());
        let client = CorrelationClient::connect(&broker, &config).await.unwrap();
        assert_eq!(client.id(), "client-close");
        assert!(broker.queue_exists("client-close"));

        client.close().await;
        assert!(!broker.queue_exists("client-close"));
    }
}
