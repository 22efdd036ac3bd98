//! Metrics collection for AnyInfer
//!
//! This module provides Prometheus metrics for observability.
//! Worker and client metrics live in one registry so a process embedding
//! both exposes a single scrape target.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for AnyInfer
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub client: ClientMetrics,
}

/// Worker-side metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Requests accepted from the input queue
    pub messages_received: IntCounter,

    /// Messages rejected because they could not be decoded
    pub messages_rejected: IntCounter,

    /// Batches handed to the inference function
    pub batches_total: IntCounter,

    /// Batch size distribution
    pub batch_size: Histogram,

    /// Inference call duration
    pub inference_duration: Histogram,

    /// Batches dropped because inference failed
    pub inference_failures: IntCounter,

    /// Results published to output queues
    pub results_published: IntCounter,

    /// Results that could not be published
    pub publish_failures: IntCounter,

    /// Requests waiting in the accumulator
    pub pending_requests: IntGauge,

    /// Drain tasks currently running
    pub inflight_drains: IntGauge,

    /// Transport errors seen by the receive loop
    pub transport_errors: IntCounter,
}

/// Client-side metrics
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    /// Requests published
    pub requests_sent: IntCounter,

    /// Matching responses received
    pub responses_received: IntCounter,

    /// Requests that timed out
    pub timeouts: IntCounter,

    /// Responses nobody was waiting for
    pub orphaned_responses: IntCounter,

    /// Send-to-response latency
    pub round_trip_duration: Histogram,

    /// Requests awaiting a response
    pub pending_requests: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("histogram registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let worker = WorkerMetrics {
            messages_received: counter(
                &registry,
                "worker_messages_received_total",
                "Total number of requests accepted from the input queue",
            ),
            messages_rejected: counter(
                &registry,
                "worker_messages_rejected_total",
                "Total number of malformed messages rejected",
            ),
            batches_total: counter(
                &registry,
                "worker_batches_total",
                "Total number of batches passed to inference",
            ),
            batch_size: histogram(
                &registry,
                "worker_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            ),
            inference_duration: histogram(
                &registry,
                "worker_inference_duration_seconds",
                "Inference call duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
            inference_failures: counter(
                &registry,
                "worker_inference_failures_total",
                "Total number of batches dropped after an inference failure",
            ),
            results_published: counter(
                &registry,
                "worker_results_published_total",
                "Total number of results published",
            ),
            publish_failures: counter(
                &registry,
                "worker_publish_failures_total",
                "Total number of results that failed to publish",
            ),
            pending_requests: gauge(
                &registry,
                "worker_pending_requests",
                "Current number of requests waiting to be batched",
            ),
            inflight_drains: gauge(
                &registry,
                "worker_inflight_drains",
                "Current number of running drain tasks",
            ),
            transport_errors: counter(
                &registry,
                "worker_transport_errors_total",
                "Total number of transport errors in the receive loop",
            ),
        };

        let client = ClientMetrics {
            requests_sent: counter(
                &registry,
                "client_requests_sent_total",
                "Total number of requests published",
            ),
            responses_received: counter(
                &registry,
                "client_responses_received_total",
                "Total number of matching responses received",
            ),
            timeouts: counter(
                &registry,
                "client_timeouts_total",
                "Total number of requests that timed out",
            ),
            orphaned_responses: counter(
                &registry,
                "client_orphaned_responses_total",
                "Total number of responses with no waiting request",
            ),
            round_trip_duration: histogram(
                &registry,
                "client_round_trip_duration_seconds",
                "Request round trip duration in seconds",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
            pending_requests: gauge(
                &registry,
                "client_pending_requests",
                "Current number of requests awaiting a response",
            ),
        };

        MetricsRegistry {
            registry,
            worker,
            client,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn observe_closure<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn observe_closure<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
