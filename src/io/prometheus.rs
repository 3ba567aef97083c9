//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::io::queue::MemoryQueue;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, queues: &[Arc<MemoryQueue>], site_id: &str) -> String {
    let summary = metrics.report();
    let mut output = String::with_capacity(4096);

    write_detector_metrics(&mut output, site_id, &summary);
    write_worker_metrics(&mut output, site_id, &summary);
    write_queue_depths(&mut output, site_id, queues);

    output
}

fn write_detector_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pipeline_images_processed_total",
        "Storage triggers handled by the detector stage",
        MetricType::Counter,
        site,
        summary.images_processed,
    );
    write_metric(
        output,
        "pipeline_validation_failures_total",
        "Malformed storage triggers",
        MetricType::Counter,
        site,
        summary.validation_failures,
    );
    write_metric(
        output,
        "pipeline_detector_failures_total",
        "Detector invocations failed on a collaborator call",
        MetricType::Counter,
        site,
        summary.detector_failures,
    );

    let _ = writeln!(output, "# HELP pipeline_routed_total Classification results routed");
    let _ = writeln!(output, "# TYPE pipeline_routed_total counter");
    let _ = writeln!(
        output,
        "pipeline_routed_total{{site=\"{site}\",jurisdiction=\"in\"}} {}",
        summary.routed_in_jurisdiction
    );
    let _ = writeln!(
        output,
        "pipeline_routed_total{{site=\"{site}\",jurisdiction=\"out\"}} {}",
        summary.routed_out_of_jurisdiction
    );

    write_metric(
        output,
        "pipeline_duplicates_suppressed_total",
        "Queue sends suppressed by the dedup window",
        MetricType::Counter,
        site,
        summary.duplicates_suppressed,
    );
}

fn write_worker_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "pipeline_messages_received_total",
        "Queue messages received by poll workers",
        MetricType::Counter,
        site,
        summary.messages_received,
    );
    write_metric(
        output,
        "pipeline_enriched_total",
        "Enriched violations published to the notification queue",
        MetricType::Counter,
        site,
        summary.enriched_published,
    );
    write_metric(
        output,
        "pipeline_plate_misses_total",
        "Plates not found in the registry",
        MetricType::Counter,
        site,
        summary.plate_misses,
    );
    write_metric(
        output,
        "pipeline_notices_published_total",
        "Owner notices published",
        MetricType::Counter,
        site,
        summary.notices_published,
    );
    write_metric(
        output,
        "pipeline_unknown_violation_types_total",
        "Violations with no fine schedule entry",
        MetricType::Counter,
        site,
        summary.unknown_violation_types,
    );
    write_metric(
        output,
        "pipeline_dead_lettered_total",
        "Messages written to the dead-letter sink",
        MetricType::Counter,
        site,
        summary.dead_lettered,
    );
    write_metric(
        output,
        "pipeline_left_for_redelivery_total",
        "Messages left undeleted after a failure",
        MetricType::Counter,
        site,
        summary.left_for_redelivery,
    );
    write_metric(
        output,
        "pipeline_poll_errors_total",
        "Queue receive errors",
        MetricType::Counter,
        site,
        summary.poll_errors,
    );

    write_histogram(
        output,
        "pipeline_message_latency_ms",
        "Receive to terminal state latency in milliseconds",
        site,
        &summary.lat_buckets,
        summary.lat_sum_ms,
    );
    write_metric(
        output,
        "pipeline_message_latency_p99_ms",
        "99th percentile message handling latency",
        MetricType::Gauge,
        site,
        summary.lat_p99_ms,
    );
}

fn write_queue_depths(output: &mut String, site: &str, queues: &[Arc<MemoryQueue>]) {
    let _ = writeln!(output, "# HELP pipeline_queue_depth Messages held per queue and state");
    let _ = writeln!(output, "# TYPE pipeline_queue_depth gauge");
    for queue in queues {
        let depth = queue.depth();
        let name = queue.name();
        let _ = writeln!(
            output,
            "pipeline_queue_depth{{site=\"{site}\",queue=\"{name}\",state=\"ready\"}} {}",
            depth.ready
        );
        let _ = writeln!(
            output,
            "pipeline_queue_depth{{site=\"{site}\",queue=\"{name}\",state=\"in_flight\"}} {}",
            depth.in_flight
        );
    }
}

fn text_response(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    queues: Arc<Vec<Arc<MemoryQueue>>>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics, &queues, &site_id),
        ),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "text/plain", "ok".to_string()),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    queues: Vec<Arc<MemoryQueue>>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);
    let queues = Arc::new(queues);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let queues = queues.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let queues = queues.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, queues, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
