//! AnyInfer broker transport
//!
//! The traits in this crate are the seam between the batching engine and the
//! message broker. A broker hands out connections; a connection declares
//! queues, publishes and subscribes; a subscription yields deliveries that
//! must be acknowledged or rejected. A delivery dropped without being settled
//! goes back to its queue, which gives at-least-once semantics.
//!
//! [`MemoryBroker`] is an in-process implementation with direct exchanges,
//! per-queue TTL and max-length limits.

pub mod memory;

pub use memory::MemoryBroker;

use anyinfer_common::config::QueueLimits;
use anyinfer_common::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Exchange that routes by queue name
pub const DEFAULT_EXCHANGE: &str = "";

/// Routes messages published to `exchange` with `routing_key` to a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
}

/// Queue declaration
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,

    /// Survive broker restarts (ignored by in-process brokers)
    pub durable: bool,

    /// Owned by the declaring connection and deleted with it
    pub exclusive: bool,

    /// Messages older than this are discarded
    pub message_ttl: Option<Duration>,

    /// Oldest ready messages are dropped beyond this length
    pub max_length: Option<usize>,

    /// Exchange bindings besides the default exchange
    pub bindings: Vec<Binding>,
}

impl QueueSpec {
    /// A transient, unbounded queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            message_ttl: None,
            max_length: None,
            bindings: Vec::new(),
        }
    }

    /// Apply configured TTL and max length
    pub fn with_limits(mut self, limits: &QueueLimits) -> Self {
        self.message_ttl = limits.message_ttl();
        self.max_length = limits.max_length;
        self
    }

    /// Mark the queue exclusive to the declaring connection
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Bind the queue to `exchange` under `routing_key`
    pub fn bind(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.bindings.push(Binding {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Entry point to a message broker
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new connection
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A connection to the broker; not shared across publishers
#[async_trait]
pub trait Connection: Send + Sync {
    /// Declare a queue and its bindings; idempotent
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Publish a message; unroutable messages are dropped
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Start consuming from a queue
    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>>;
}

/// A consumer attached to one queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery
    ///
    /// Returns `Ok(None)` once `timeout` elapses without a message; waits
    /// indefinitely when `timeout` is `None`.
    async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>>;
}

/// Settles a delivery with the broker
pub trait Acker: Send {
    fn ack(self: Box<Self>) -> Result<()>;

    fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}

/// A received message awaiting acknowledgement
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker: Some(acker),
        }
    }

    /// Message payload
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the message was delivered before and requeued
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge the message, removing it from the broker
    pub fn ack(mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack(),
            None => Ok(()),
        }
    }

    /// Reject the message, optionally returning it to its queue
    pub fn reject(mut self, requeue: bool) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.reject(requeue),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            let _ = acker.reject(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_spec_builder() {
        let limits = QueueLimits {
            message_ttl_secs: Some(4),
            max_length: Some(32),
        };
        let spec = QueueSpec::new("client-a")
            .with_limits(&limits)
            .exclusive()
            .bind("outputs", "client-a");

        assert!(spec.exclusive);
        assert!(!spec.durable);
        assert_eq!(spec.message_ttl, Some(Duration::from_secs(4)));
        assert_eq!(spec.max_length, Some(32));
        assert_eq!(
            spec.bindings,
            vec![Binding {
                exchange: "outputs".to_string(),
                routing_key: "client-a".to_string()
            }]
        );
    }
}
