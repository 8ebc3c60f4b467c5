use std::net::SocketAddr;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Histogram buckets for the processing-latency SLO.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("rfid_processor_batch_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .expect("valid bucket list")
        .set_buckets_for_metric(
            Matcher::Full("rfid_llrp_processing_duration_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .expect("valid bucket list")
}

/// Install the Prometheus recorder without an HTTP listener; scraping is
/// someone else's problem (tests, embedded exporters).
pub fn init_prometheus_exporter() {
    builder()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");
}

/// Install the Prometheus recorder with its own exposition endpoint.
pub fn start_metrics_server(addr: SocketAddr) {
    builder()
        .with_http_listener(addr)
        .install()
        .expect("Failed to start metrics server");
}
