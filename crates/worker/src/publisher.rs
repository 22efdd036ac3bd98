//! Result publishing pool
//!
//! A fixed number of publisher tasks share one work channel. Each task opens
//! its own broker connection when it starts and keeps it for its lifetime.

use anyinfer_broker::{Broker, Connection};
use anyinfer_common::{AnyInferError, Result, METRICS};
use anyinfer_proto::Response;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type WorkQueue = Arc<Mutex<mpsc::UnboundedReceiver<Response>>>;

/// Pool of publisher tasks
pub struct PublisherPool {
    sender: mpsc::UnboundedSender<Response>,
    handles: Vec<JoinHandle<()>>,
}

/// Cheap handle used by drain tasks to submit results
#[derive(Clone)]
pub struct PublishHandle {
    sender: mpsc::UnboundedSender<Response>,
}

impl PublishHandle {
    /// Queue a result for publishing without waiting for it
    pub fn submit(&self, response: Response) -> Result<()> {
        self.sender
            .send(response)
            .map_err(|_| AnyInferError::shutdown("publisher pool is closed"))
    }
}

impl PublisherPool {
    /// Connect `size` publishers to `broker`
    pub async fn start(
        broker: Arc<dyn Broker>,
        outputs_exchange: impl Into<String>,
        size: usize,
    ) -> Result<Self> {
        let outputs_exchange: Arc<str> = Arc::from(outputs_exchange.into());
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: WorkQueue = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let connection = broker.connect().await?;
            handles.push(tokio::spawn(publish_loop(
                index,
                connection,
                queue.clone(),
                outputs_exchange.clone(),
            )));
        }

        info!("Started {} publishers on exchange {:?}", size, outputs_exchange);

        Ok(Self { sender, handles })
    }

    /// Handle for submitting results
    pub fn handle(&self) -> PublishHandle {
        PublishHandle {
            sender: self.sender.clone(),
        }
    }

    /// Stop accepting results and wait until queued ones are published
    ///
    /// Outstanding [`PublishHandle`]s keep the pool alive until they are dropped.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Publisher task failed: {}", e);
            }
        }
        debug!("Publisher pool stopped");
    }
}

async fn publish_loop(
    index: usize,
    connection: Box<dyn Connection>,
    queue: WorkQueue,
    outputs_exchange: Arc<str>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(response) = next else {
            break;
        };

        if let Err(e) = publish(connection.as_ref(), &outputs_exchange, &response).await {
            METRICS.worker.publish_failures.inc();
            error!(
                "[publisher-{}] Failed to publish {} -> {}: {}",
                index,
                response.uid(),
                response.pid(),
                e
            );
        }
    }
}

/// Publish one result to the private queue of the client that sent it
pub async fn publish(
    connection: &dyn Connection,
    outputs_exchange: &str,
    response: &Response,
) -> Result<()> {
    let body = response.to_bytes()?;
    connection
        .publish(outputs_exchange, response.pid(), body)
        .await?;

    METRICS.worker.results_published.inc();
    debug!("{} -> {}", response.uid(), response.pid());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyinfer_broker::{MemoryBroker, QueueSpec};
    use anyinfer_proto::Request;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn response(uid: &str, pid: &str) -> Response {
        Response::new(Request::new(uid, pid, Map::new()), json!(uid))
    }

    #[tokio::test]
    async fn test_results_routed_by_pid() {
        let broker = MemoryBroker::new();
        let observer = broker.connect().await.unwrap();
        for client in ["client-a", "client-b"] {
            observer
                .declare_queue(&QueueSpec::new(client).bind("outputs", client))
                .await
                .unwrap();
        }

        let pool = PublisherPool::start(Arc::new(broker.clone()), "outputs", 2)
            .await
            .unwrap();
        let handle = pool.handle();
        handle.submit(response("1", "client-a")).unwrap();
        handle.submit(response("2", "client-b")).unwrap();
        handle.submit(response("3", "client-b")).unwrap();
        drop(handle);
        pool.shutdown().await;

        assert_eq!(broker.queue_depth("client-a"), Some(1));
        assert_eq!(broker.queue_depth("client-b"), Some(2));

        let mut subscription = observer.subscribe("client-a").await.unwrap();
        let delivery = subscription
            .next(Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap();
        let decoded = Response::from_slice(delivery.body()).unwrap();
        assert_eq!(decoded.uid(), "1");
        assert_eq!(decoded.prediction, json!("1"));
        delivery.ack().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_outstanding_handles() {
        let broker = MemoryBroker::new();
        let observer = broker.connect().await.unwrap();
        observer
            .declare_queue(&QueueSpec::new("client-a").bind("outputs", "client-a"))
            .await
            .unwrap();

        let pool = PublisherPool::start(Arc::new(broker.clone()), "outputs", 1)
            .await
            .unwrap();
        let handle = pool.handle();

        let shutdown = tokio::spawn(pool.shutdown());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        handle.submit(response("late", "client-a")).unwrap();
        drop(handle);
        shutdown.await.unwrap();

        assert_eq!(broker.queue_depth("client-a"), Some(1));
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_online(false);

        let result = PublisherPool::start(Arc::new(broker), "outputs", 2).await;
        assert!(result.is_err());
    }
}
