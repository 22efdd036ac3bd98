//! AnyInfer Client
//!
//! Sends inference requests through the broker and waits for the matching
//! results on a private output queue.

pub mod correlation;
pub mod pending;

pub use correlation::CorrelationClient;
pub use pending::PendingTable;
