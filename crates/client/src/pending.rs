//! Table of requests awaiting a response

use anyinfer_common::METRICS;
use anyinfer_proto::Response;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Maps correlation identifiers to single-use completion channels
#[derive(Default)]
pub struct PendingTable {
    slots: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `uid`
    pub fn register(&self, uid: &str) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        let mut slots = self.slots.lock();
        slots.insert(uid.to_string(), sender);
        METRICS.client.pending_requests.set(slots.len() as i64);
        receiver
    }

    /// Hand a response to its waiter; false if nobody is waiting for it
    pub fn complete(&self, response: Response) -> bool {
        let sender = {
            let mut slots = self.slots.lock();
            let sender = slots.remove(response.uid());
            METRICS.client.pending_requests.set(slots.len() as i64);
            sender
        };

        match sender {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for `uid`
    pub fn cancel(&self, uid: &str) {
        let mut slots = self.slots.lock();
        slots.remove(uid);
        METRICS.client.pending_requests.set(slots.len() as i64);
    }

    /// Drop every slot; waiters see their channel closed
    pub fn close_all(&self) {
        let mut slots = self.slots.lock();
        slots.clear();
        METRICS.client.pending_requests.set(0);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyinfer_proto::Request;
    use serde_json::{json, Map};

    fn response(uid: &str) -> Response {
        Response::new(Request::new(uid, "client", Map::new()), json!(uid))
    }

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let table = PendingTable::new();
        let receiver = table.register("a");

        assert!(table.complete(response("a")));
        assert_eq!(receiver.await.unwrap().uid(), "a");
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_uid_is_not_delivered() {
        let table = PendingTable::new();
        let _receiver = table.register("a");

        assert!(!table.complete(response("b")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_then_complete() {
        let table = PendingTable::new();
        let _receiver = table.register("a");
        table.cancel("a");

        assert!(!table.complete(response("a")));
    }

    #[tokio::test]
    async fn test_close_all_fails_waiters() {
        let table = PendingTable::new();
        let receiver = table.register("a");
        table.close_all();

        assert!(receiver.await.is_err());
    }
}
