//! AnyInfer Worker - Demo Entry Point
//!
//! Runs a batching worker with an echo model and a correlation client on an
//! in-process broker, sends a burst of requests and logs every answer.

use anyinfer_broker::{Broker, MemoryBroker};
use anyinfer_client::CorrelationClient;
use anyinfer_common::{AnyInferConfig, AnyInferError, Result, METRICS};
use anyinfer_proto::Request;
use anyinfer_worker::{from_fn, BatchingWorker};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DEMO_REQUESTS: usize = 36;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("ANYINFER_CONFIG").ok().map(PathBuf::from);
    let config = AnyInferConfig::load(config_path.as_deref())?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("anyinfer_worker={0},anyinfer_client={0}", level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting AnyInfer demo: inputs={:?}, outputs={:?}, max_batch={}, wait_ms={}",
        config.broker.inputs_queue,
        config.broker.outputs_exchange,
        config.worker.max_batch,
        config.worker.wait_ms
    );

    let requests = match std::env::var("ANYINFER_DEMO_REQUESTS") {
        Ok(raw) => raw
            .parse::<usize>()
            .map_err(|e| AnyInferError::config(format!("ANYINFER_DEMO_REQUESTS={}: {}", raw, e)))?,
        Err(_) => DEFAULT_DEMO_REQUESTS,
    };

    let broker = MemoryBroker::new();

    // Echo model: every request's user fields come back as its prediction
    let echo = from_fn(|batch: &[Request]| {
        std::thread::sleep(Duration::from_millis(50));
        Ok(batch.iter().map(|r| Value::Object(r.fields.clone())).collect())
    });

    let worker = Arc::new(BatchingWorker::new(
        Arc::new(broker.clone()) as Arc<dyn Broker>,
        config.clone(),
        echo,
    ));

    let (stop, stopped) = oneshot::channel::<()>();
    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker
                .run_until(async {
                    tokio::select! {
                        _ = stopped => {}
                        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
                    }
                })
                .await
        })
    };

    let client = Arc::new(CorrelationClient::connect(&broker, &config).await?);
    info!("Sending {} requests as {}", requests, client.id());

    let calls: Vec<_> = (0..requests)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.send_json(json!({"foo": "baa"})).await })
        })
        .collect();

    let mut answered = 0;
    for call in calls {
        match call.await {
            Ok(Ok(response)) => {
                answered += 1;
                info!("{} -> {}", response.uid(), response.prediction);
            }
            Ok(Err(AnyInferError::Timeout(_))) => info!("Timeout"),
            Ok(Err(e)) => warn!("Request failed: {}", e),
            Err(e) => warn!("Request task failed: {}", e),
        }
    }
    info!("{}/{} requests answered", answered, requests);

    if config.observability.enable_metrics {
        info!("Metrics:\n{}", METRICS.gather());
    }

    let _ = stop.send(());
    match worker_handle.await {
        Ok(result) => result?,
        Err(e) => return Err(AnyInferError::internal(format!("worker task failed: {}", e))),
    }

    info!("AnyInfer demo complete");
    Ok(())
}
