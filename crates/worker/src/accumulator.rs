//! Request accumulation and exclusive draining
//!
//! Requests arriving from the input queue are pushed into a shared buffer.
//! Drain tasks remove bounded slices of it under the buffer's guard, so two
//! concurrent drains never see the same request and a drained request never
//! returns to the buffer. A second guard serializes inference; the buffer
//! guard is only held while requests are added or taken.

use anyinfer_proto::Request;
use parking_lot::Mutex;

/// Requests drained together for one inference call
#[derive(Debug)]
pub struct Batch {
    requests: Vec<Request>,
}

impl Batch {
    fn new(requests: Vec<Request>) -> Self {
        Self { requests }
    }

    /// Get the batch size
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Requests in drain order
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Correlation identifiers, for logging
    pub fn uids(&self) -> Vec<&str> {
        self.requests.iter().map(|r| r.uid.as_str()).collect()
    }

    /// Take ownership of the requests
    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}

/// Shared buffer of pending requests
pub struct Accumulator {
    pending: Mutex<Vec<Request>>,
    inference: Mutex<()>,
}

impl Accumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            inference: Mutex::new(()),
        }
    }

    /// Append a request
    pub fn push(&self, request: Request) {
        self.pending.lock().push(request);
    }

    /// Remove up to `limit` requests; never waits for more to arrive
    pub fn drain(&self, limit: usize) -> Batch {
        let mut pending = self.pending.lock();
        Self::take(&mut pending, limit)
    }

    /// Drain up to `limit` requests and run `f` on them
    ///
    /// Callers serialize on the inference guard for as long as `f` runs, so at
    /// most one `f` executes at a time per accumulator. `push` is not held up.
    pub fn drain_with<F, R>(&self, limit: usize, f: F) -> (Batch, R)
    where
        F: FnOnce(&Batch) -> R,
    {
        let _inference = self.inference.lock();
        let batch = self.drain(limit);
        let result = f(&batch);
        (batch, result)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    // Most recently pushed first.
    fn take(pending: &mut Vec<Request>, limit: usize) -> Batch {
        let count = limit.min(pending.len());
        let start = pending.len() - count;
        let mut requests = pending.split_off(start);
        requests.reverse();
        Batch::new(requests)
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
