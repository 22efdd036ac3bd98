//! In-process broker
//!
//! Implements the broker traits with direct exchanges: a message published to
//! `(exchange, routing_key)` lands in every queue bound under that pair, and
//! the default exchange routes by queue name. Queues enforce TTL on read and
//! max length with drop-head overflow. Unacknowledged deliveries are tracked
//! until they are settled.

use crate::{Acker, Broker, Connection, Delivery, QueueSpec, Subscription, DEFAULT_EXCHANGE};
use anyinfer_common::{AnyInferError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Message broker living inside the current process
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    topology: Mutex<Topology>,
    online: AtomicBool,
    next_connection_id: AtomicU64,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, Arc<MemoryQueue>>,
    bindings: HashMap<(String, String), Vec<String>>,
}

struct MemoryQueue {
    name: String,
    message_ttl: Option<Duration>,
    max_length: Option<usize>,
    owner: Option<u64>,
    inner: Mutex<QueueInner>,
    notify: Notify,
    deleted: AtomicBool,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    next_tag: u64,
}

struct StoredMessage {
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
}

impl MemoryQueue {
    fn new(spec: &QueueSpec, owner: Option<u64>) -> Self {
        Self {
            name: spec.name.clone(),
            message_ttl: spec.message_ttl,
            max_length: spec.max_length,
            owner,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            deleted: AtomicBool::new(false),
        }
    }

    fn is_expired(&self, message: &StoredMessage, now: Instant) -> bool {
        self.message_ttl
            .map(|ttl| now.duration_since(message.enqueued_at) >= ttl)
            .unwrap_or(false)
    }

    fn enqueue(&self, body: Vec<u8>) {
        {
            let mut inner = self.inner.lock();
            if let Some(max_length) = self.max_length {
                while inner.ready.len() >= max_length {
                    inner.ready.pop_front();
                    trace!("Queue {} full, dropped oldest message", self.name);
                }
            }
            inner.ready.push_back(StoredMessage {
                body,
                enqueued_at: Instant::now(),
                redelivered: false,
            });
        }
        self.notify.notify_one();
    }

    /// Pop the first live message and move it to the unacked set
    fn take_ready(&self) -> Option<(u64, Vec<u8>, bool)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        while let Some(message) = inner.ready.pop_front() {
            if self.is_expired(&message, now) {
                trace!("Queue {} discarded expired message", self.name);
                continue;
            }

            let tag = inner.next_tag;
            inner.next_tag += 1;
            let body = message.body.clone();
            let redelivered = message.redelivered;
            inner.unacked.insert(tag, message);
            return Some((tag, body, redelivered));
        }

        None
    }

    fn settle(&self, tag: u64, requeue: bool) -> Result<()> {
        let message = self.inner.lock().unacked.remove(&tag);

        match message {
            Some(mut message) if requeue && !self.deleted.load(Ordering::SeqCst) => {
                message.redelivered = true;
                self.inner.lock().ready.push_front(message);
                self.notify.notify_one();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(AnyInferError::transport(format!(
                "unknown delivery tag {} on queue {}",
                tag, self.name
            ))),
        }
    }

    fn ready_len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .filter(|message| !self.is_expired(message, now))
            .count()
    }

    fn unacked_len(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.ready.clear();
        inner.unacked.clear();
        drop(inner);
        self.notify.notify_waiters();
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                topology: Mutex::new(Topology::default()),
                online: AtomicBool::new(true),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Simulate an outage; while offline every operation fails with a transport error
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
        if !online {
            let topology = self.state.topology.lock();
            for queue in topology.queues.values() {
                queue.notify.notify_waiters();
            }
        }
    }

    /// Whether the broker currently accepts operations
    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    /// Number of live messages ready for delivery in a queue
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(|queue| queue.ready_len())
    }

    /// Number of delivered but unsettled messages in a queue
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.queue(queue).map(|queue| queue.unacked_len())
    }

    /// Whether a queue is currently declared
    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queue(queue).is_some()
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.state.topology.lock().queues.get(name).cloned()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(AnyInferError::transport("broker unreachable"))
        }
    }

    fn declare(&self, spec: &QueueSpec, connection_id: u64) -> Result<()> {
        let mut topology = self.state.topology.lock();

        match topology.queues.get(&spec.name) {
            Some(existing) => {
                if existing.owner.is_some() && existing.owner != Some(connection_id) {
                    return Err(AnyInferError::transport(format!(
                        "queue {} is exclusive to another connection",
                        spec.name
                    )));
                }
            }
            None => {
                let owner = spec.exclusive.then_some(connection_id);
                topology
                    .queues
                    .insert(spec.name.clone(), Arc::new(MemoryQueue::new(spec, owner)));
                debug!(
                    "Declared queue {} (ttl={:?}, max_length={:?}, exclusive={})",
                    spec.name, spec.message_ttl, spec.max_length, spec.exclusive
                );
            }
        }

        for binding in &spec.bindings {
            let queues = topology
                .bindings
                .entry((binding.exchange.clone(), binding.routing_key.clone()))
                .or_default();
            if !queues.contains(&spec.name) {
                queues.push(spec.name.clone());
            }
        }

        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<Arc<MemoryQueue>> {
        let topology = self.state.topology.lock();

        if exchange == DEFAULT_EXCHANGE {
            return topology.queues.get(routing_key).cloned().into_iter().collect();
        }

        topology
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| topology.queues.get(name).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn drop_exclusive_queues(&self, connection_id: u64) {
        let mut topology = self.state.topology.lock();

        let owned: Vec<String> = topology
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();

        for name in owned {
            if let Some(queue) = topology.queues.remove(&name) {
                queue.delete();
            }
            for queues in topology.bindings.values_mut() {
                queues.retain(|queue| queue != &name);
            }
            debug!("Deleted exclusive queue {}", name);
        }

        topology.bindings.retain(|_, queues| !queues.is_empty());
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.ensure_online()?;
        let id = self.state.next_connection_id.fetch_add(1, Ordering::SeqCst);
        trace!("Opened connection {}", id);
        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

/// Connection to a [`MemoryBroker`]; exclusive queues it declared are deleted on drop
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.broker.ensure_online()?;
        self.broker.declare(spec, self.id)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.broker.ensure_online()?;

        let queues = self.broker.route(exchange, routing_key);
        if queues.is_empty() {
            trace!(
                "Unroutable message dropped (exchange={:?}, routing_key={})",
                exchange,
                routing_key
            );
            return Ok(());
        }

        if let Some((last, rest)) = queues.split_last() {
            for queue in rest {
                queue.enqueue(body.clone());
            }
            last.enqueue(body);
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>> {
        self.broker.ensure_online()?;

        let queue = self
            .broker
            .queue(queue)
            .ok_or_else(|| AnyInferError::not_found(format!("queue {}", queue)))?;

        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            queue,
        }))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.drop_exclusive_queues(self.id);
        trace!("Closed connection {}", self.id);
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            self.broker.ensure_online()?;
            if self.queue.deleted.load(Ordering::SeqCst) {
                return Err(AnyInferError::not_found(format!(
                    "queue {} was deleted",
                    self.queue.name
                )));
            }

            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((tag, body, redelivered)) = self.queue.take_ready() {
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    tag,
                };
                return Ok(Some(Delivery::new(body, redelivered, Box::new(acker))));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    tag: u64,
}

impl Acker for MemoryAcker {
    fn ack(self: Box<Self>) -> Result<()> {
        self.queue.settle(self.tag, false)
    }

    fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        self.queue.settle(self.tag, requeue)
    }
}
