//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder
///
/// With `listen` set, metrics are also served over HTTP on that address.
/// Returns a handle that can be used to render metrics.
pub fn setup_metrics(
    listen: Option<SocketAddr>,
) -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let builder = match listen {
        Some(addr) => PrometheusBuilder::new().with_http_listener(addr),
        None => PrometheusBuilder::new(),
    };

    let handle = builder
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    match listen {
        Some(addr) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
        None => tracing::info!("Prometheus metrics exporter installed"),
    }

    Ok(handle)
}

/// Record a completed synchronization
pub fn record_sync(model: &str, files: usize, bytes: u64) {
    metrics::counter!("gguf_tracker_syncs_total", "model" => model.to_string()).increment(1);
    metrics::counter!("gguf_tracker_files_fetched_total", "model" => model.to_string())
        .increment(files as u64);
    metrics::counter!("gguf_tracker_bytes_fetched_total", "model" => model.to_string())
        .increment(bytes);
}

/// Record a staleness check that found the local copy current
pub fn record_up_to_date(model: &str) {
    metrics::counter!("gguf_tracker_up_to_date_total", "model" => model.to_string()).increment(1);
}

/// Record a failed object transfer
pub fn record_transfer_failure(model: &str) {
    metrics::counter!("gguf_tracker_transfer_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a serving instance start
pub fn record_instance_started(model_id: &str, port: u16) {
    metrics::counter!("gguf_tracker_instances_started_total",
        "model" => model_id.to_string(),
        "port" => port.to_string()
    )
    .increment(1);
}

/// Record a serving instance stop
pub fn record_instance_stopped(model_id: &str) {
    metrics::counter!("gguf_tracker_instances_stopped_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Update total instance count gauge
pub fn update_instance_count(count: usize) {
    metrics::gauge!("gguf_tracker_instances_count").set(count as f64);
}
