//! Violation pipeline - automated traffic-violation ticketing
//!
//! Runs every stage in one process:
//! object watcher -> detector -> violation queue -> enricher -> enriched
//! queue -> notifier, with out-of-jurisdiction plates published to the
//! event bus.
//!
//! Module structure:
//! - `domain/` - Core types and pure logic (classifier, fines, notices)
//! - `io/` - External interfaces (queues, object store, detector, registry, MQTT)
//! - `services/` - Pipeline stages (Detector, Router, Enricher, Notifier)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use violation_pipeline::domain::NoticeFormatter;
use violation_pipeline::infra::{Config, Metrics};
use violation_pipeline::io::{
    mqtt_bus, FileRegistry, FsObjectStore, HttpTextDetector, JsonlDeadLetterSink, MemoryQueue,
    MqttEventBus, MqttNotificationChannel, ObjectWatcher, QueueSettings,
};
use violation_pipeline::services::{
    DetectorSettings, DetectorStage, Enricher, Notifier, PollWorker, Router, RouterSettings,
    WorkerSettings,
};

/// Violation pipeline - image to owner notice
#[derive(Parser, Debug)]
#[command(name = "violation-pipeline", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("violation-pipeline starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        object_store_dir = %config.object_store_dir(),
        bucket = %config.bucket(),
        detector_url = %config.detector_url(),
        registry_path = %config.registry_path(),
        enricher_replicas = %config.enricher_replicas(),
        notifier_replicas = %config.notifier_replicas(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    violation_pipeline::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Queues
    let queue_settings = QueueSettings {
        visibility_timeout: Duration::from_secs(config.visibility_timeout_secs()),
        dedup_window: Duration::from_secs(config.dedup_window_secs()),
    };
    let violation_queue = Arc::new(MemoryQueue::new("violations", queue_settings));
    let enriched_queue = Arc::new(MemoryQueue::new("enriched", queue_settings));

    // Collaborators; MQTT outlives the workers so their last publishes are acknowledged
    let (mqtt_shutdown_tx, mqtt_shutdown_rx) = watch::channel(false);
    let (mqtt, mqtt_driver) = mqtt_bus::connect(&config, mqtt_shutdown_rx);
    let event_bus = Arc::new(MqttEventBus::new(mqtt.clone(), config.bus_topic_prefix()));
    let notices = Arc::new(MqttNotificationChannel::new(mqtt, config.notification_topic()));
    let object_store = Arc::new(FsObjectStore::new(config.object_store_dir()));
    let bucket_dir = object_store.bucket_dir(config.bucket())?;
    let text_detector = Arc::new(HttpTextDetector::new(
        config.detector_url(),
        Duration::from_millis(config.detector_timeout_ms()),
    )?);
    let registry = Arc::new(FileRegistry::new(
        config.registry_path(),
        Duration::from_millis(config.registry_staleness_ms()),
    ));
    let dead_letters = Arc::new(JsonlDeadLetterSink::new(config.dead_letter_file()));

    // Detector stage, one invocation per stored image
    let router = Router::new(
        violation_queue.clone(),
        event_bus,
        RouterSettings::from_config(&config),
        metrics.clone(),
    );
    let detector = Arc::new(DetectorStage::new(
        object_store,
        text_detector,
        router,
        dead_letters.clone(),
        metrics.clone(),
        DetectorSettings::from_config(&config),
    ));
    let (trigger_tx, trigger_rx) = mpsc::channel(256);
    tokio::spawn(detector.run(trigger_rx, shutdown_rx.clone()));

    let watcher = ObjectWatcher::new(
        &bucket_dir,
        config.bucket(),
        config.image_extension(),
        Duration::from_millis(config.scan_interval_ms()),
    );
    tokio::spawn(watcher.run(trigger_tx, shutdown_rx.clone()));

    // Poll workers
    let worker_settings = WorkerSettings::from_config(&config);
    let mut workers = Vec::new();

    for _ in 0..config.enricher_replicas() {
        let enricher = Enricher::new(
            registry.clone(),
            enriched_queue.clone(),
            config.enriched_group_id(),
            metrics.clone(),
        );
        let worker = PollWorker::new(
            violation_queue.clone(),
            enricher,
            dead_letters.clone(),
            metrics.clone(),
            worker_settings,
        );
        let worker_shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(worker_shutdown).await }));
    }

    let formatter = NoticeFormatter::for_zone_name(config.time_zone())?;
    for _ in 0..config.notifier_replicas() {
        let notifier = Notifier::new(
            config.fine_schedule(),
            formatter.clone(),
            notices.clone(),
            metrics.clone(),
        );
        let worker = PollWorker::new(
            enriched_queue.clone(),
            notifier,
            dead_letters.clone(),
            metrics.clone(),
            worker_settings,
        );
        let worker_shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move { worker.run(worker_shutdown).await }));
    }

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_queues = vec![violation_queue.clone(), enriched_queue.clone()];
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = violation_pipeline::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_queues,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Workers finish the message they hold before exiting
    for worker in workers {
        let _ = worker.await;
    }
    let _ = mqtt_shutdown_tx.send(true);
    let _ = mqtt_driver.await;
    metrics.report().log();

    info!("violation-pipeline shutdown complete");
    Ok(())
}
