//! End-to-end pipeline tests over the in-memory collaborators
//!
//! Time is paused so visibility timeouts can be stepped through.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use violation_pipeline::domain::error::PipelineError;
use violation_pipeline::domain::{
    FineSchedule, NoticeFormatter, Owner, RejectReason, StoredObject, TextDetection, VehicleRecord,
    ViolationMetadata,
};
use violation_pipeline::infra::Metrics;
use violation_pipeline::io::memory::{
    MemoryDeadLetterSink, MemoryEventBus, MemoryNotificationChannel, MemoryObjectStore,
    MemoryRegistry, StaticTextDetector,
};
use violation_pipeline::io::{MemoryQueue, MessageQueue, QueueSettings, StorageEvent};
use violation_pipeline::services::{
    DetectorSettings, DetectorStage, Enricher, MessageHandler, Notifier, PollOutcome, PollWorker, RouteOutcome,
    Router, RouterSettings, WorkerSettings,
};

const BUCKET: &str = "traffic-violations";
const VISIBILITY: Duration = Duration::from_secs(30);

struct Pipeline {
    store: Arc<MemoryObjectStore>,
    text: Arc<StaticTextDetector>,
    registry: Arc<MemoryRegistry>,
    bus: Arc<MemoryEventBus>,
    notices: Arc<MemoryNotificationChannel>,
    dead_letters: Arc<MemoryDeadLetterSink>,
    violations: Arc<MemoryQueue>,
    enriched: Arc<MemoryQueue>,
    metrics: Arc<Metrics>,
    detector: DetectorStage,
    enricher: Arc<PollWorker<Enricher>>,
    notifier: Arc<PollWorker<Notifier>>,
}

fn vehicle(plate: &str, make: &str, model: &str, color: &str, name: &str, contact: &str) -> VehicleRecord {
    VehicleRecord {
        plate: plate.to_string(),
        make: make.to_string(),
        model: model.to_string(),
        color: color.to_string(),
        owner: Owner { name: name.to_string(), contact: contact.to_string() },
    }
}

impl Pipeline {
    fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::default());
        let text = Arc::new(StaticTextDetector::default());
        let registry = Arc::new(MemoryRegistry::default());
        let bus = Arc::new(MemoryEventBus::default());
        let notices = Arc::new(MemoryNotificationChannel::default());
        let dead_letters = Arc::new(MemoryDeadLetterSink::default());
        let metrics = Arc::new(Metrics::new());

        let queue_settings =
            QueueSettings { visibility_timeout: VISIBILITY, dedup_window: Duration::from_secs(300) };
        let violations = Arc::new(MemoryQueue::new("violations", queue_settings));
        let enriched = Arc::new(MemoryQueue::new("enriched", queue_settings));
        let worker_settings = WorkerSettings { wait: Duration::from_secs(1), max_receive_count: 5 };

        registry.insert(vehicle("3ABC123", "Toyota", "Camry", "Blue", "J Doe", "j@x.com"));
        registry.insert(vehicle("7XYZ321", "Honda", "Civic", "Red", "A Smith", "a@smith.org"));

        let router =
            Router::new(violations.clone(), bus.clone(), RouterSettings::default(), metrics.clone());
        let detector_settings = DetectorSettings { max_attempts: 3, retry_backoff: Duration::from_millis(500) };
        let detector = DetectorStage::new(
            store.clone(),
            text.clone(),
            router,
            dead_letters.clone(),
            metrics.clone(),
            detector_settings,
        );

        let enricher = Arc::new(PollWorker::new(
            violations.clone(),
            Enricher::new(registry.clone(), enriched.clone(), "enriched", metrics.clone()),
            dead_letters.clone(),
            metrics.clone(),
            worker_settings,
        ));
        let notifier = Arc::new(PollWorker::new(
            enriched.clone(),
            Notifier::new(
                FineSchedule::default(),
                NoticeFormatter::default(),
                notices.clone(),
                metrics.clone(),
            ),
            dead_letters.clone(),
            metrics.clone(),
            worker_settings,
        ));

        Self {
            store,
            text,
            registry,
            bus,
            notices,
            dead_letters,
            violations,
            enriched,
            metrics,
            detector,
            enricher,
            notifier,
        }
    }

    /// Store an image with metadata and canned detections, returning its trigger
    fn capture(&self, key: &str, tokens: &[&str], violation_type: &str, timestamp: &str) -> StorageEvent {
        let metadata = ViolationMetadata {
            violation_type: violation_type.to_string(),
            timestamp: timestamp.to_string(),
            location: "Main St".to_string(),
        };
        self.store.insert(
            BUCKET,
            key,
            StoredObject { bytes: Bytes::from_static(b"jpeg"), metadata: metadata.to_map() },
        );
        self.text.insert(key, tokens.iter().map(|t| TextDetection::new(*t, 95.0)).collect());
        StorageEvent::for_object(BUCKET, key)
    }

    fn queues_empty(&self) -> bool {
        let a = self.violations.depth();
        let b = self.enriched.depth();
        a.ready + a.in_flight + b.ready + b.in_flight == 0
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_jurisdiction_image_produces_notice() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123", "RANDOMTEXT"], "no_stop", "2024-05-01T10:00:00Z");

    let routed = p.detector.handle(&trigger).await.unwrap();
    assert!(matches!(routed, RouteOutcome::Enqueued { duplicate: false, .. }));
    assert!(p.bus.published().is_empty());

    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);

    let notices = p.notices.published();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].recipient_contact, "j@x.com");
    assert_eq!(
        notices[0].body,
        "Hello J Doe,\n\
         Your vehicle was involved in a traffic violation. Please pay the specified ticket amount by 30 days:\n\
         Vehicle: Blue Toyota Camry\n\
         License plate: 3ABC123\n\
         Date: 5/1/2024, 3:00:00 AM\n\
         Violation address: Main St\n\
         Violation type: no_stop\n\
         Ticket amount: $300"
    );
    assert!(p.queues_empty());
    assert!(p.dead_letters.letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_out_of_jurisdiction_image_goes_to_bus() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["9XYZ98", "NEVADA"], "no_stop", "2024-05-01T10:00:00Z");

    assert_eq!(p.detector.handle(&trigger).await.unwrap(), RouteOutcome::Published);

    let published = p.bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].detail.plate, "");
    assert_eq!(published[0].detail.violation_type, "no_stop");
    assert_eq!(p.violations.depth().ready, 0);
    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_plate_is_a_lookup_miss() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["5DEF456"], "no_stop", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();

    assert_eq!(
        p.enricher.poll_once().await.unwrap(),
        PollOutcome::Rejected(RejectReason::PlateNotFound)
    );
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Idle);
    assert!(p.notices.published().is_empty());
    assert!(p.queues_empty());

    let letters = p.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, "enricher");
    assert!(letters[0].body.contains("5DEF456"));
    assert_eq!(p.metrics.report().plate_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_trigger_notifies_once() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "no_right_on_red", "2024-05-01T10:00:00Z");

    p.detector.handle(&trigger).await.unwrap();
    let replay = p.detector.handle(&trigger).await.unwrap();
    assert!(matches!(replay, RouteOutcome::Enqueued { duplicate: true, .. }));

    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Idle);
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);

    // A replay after the pipeline drained is still inside the dedup window
    p.detector.handle(&trigger).await.unwrap();
    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Idle);

    assert_eq!(p.notices.published().len(), 1);
    assert!(p.notices.published()[0].body.ends_with("Ticket amount: $125"));
}

#[tokio::test(start_paused = true)]
async fn test_enricher_crash_before_delete_is_deduplicated() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "no_stop", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();

    // Publish succeeds, then the process dies before acknowledging
    let message = p.violations.receive(Duration::ZERO).await.unwrap().unwrap();
    p.enricher.handler().handle(&message.body).await.unwrap();
    assert_eq!(p.enriched.depth().ready, 1);

    // Group stays blocked until the visibility timeout lapses
    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Idle);
    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;

    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.enriched.depth().ready, 1);
    assert_eq!(p.metrics.report().duplicates_suppressed, 1);

    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Idle);
    assert_eq!(p.notices.published().len(), 1);
    assert!(p.queues_empty());
}

#[tokio::test(start_paused = true)]
async fn test_notification_failure_is_redelivered() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "no_full_stop_on_right", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();
    p.enricher.poll_once().await.unwrap();

    p.notices.fail_next(1);
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::LeftForRedelivery);
    assert!(p.notices.published().is_empty());
    assert_eq!(p.enriched.depth().in_flight, 1);

    tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);

    let notices = p.notices.published();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].body.ends_with("Ticket amount: $75"));
    assert!(p.queues_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_violation_type_is_dead_lettered() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "speeding", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();

    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(
        p.notifier.poll_once().await.unwrap(),
        PollOutcome::Rejected(RejectReason::UnknownViolationType)
    );
    assert!(p.notices.published().is_empty());
    assert_eq!(p.dead_letters.letters()[0].stage, "notifier");
    assert!(p.queues_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_is_dead_lettered() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "no_stop", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();
    p.registry.fail_next(100);

    for _ in 0..5 {
        assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::LeftForRedelivery);
        tokio::time::advance(VISIBILITY + Duration::from_secs(1)).await;
    }
    assert_eq!(
        p.enricher.poll_once().await.unwrap(),
        PollOutcome::Rejected(RejectReason::MaxReceivesExceeded)
    );

    let letters = p.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].receive_count, 6);
    assert!(p.queues_empty());
}

#[tokio::test(start_paused = true)]
async fn test_group_order_is_preserved() {
    let p = Pipeline::new();
    for (key, plate) in [("1.jpg", "3ABC123"), ("2.jpg", "7XYZ321"), ("3.jpg", "3ABC123")] {
        let trigger = p.capture(key, &[plate], "no_stop", "2024-05-01T10:00:00Z");
        p.detector.handle(&trigger).await.unwrap();
    }

    for _ in 0..3 {
        assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    }
    for _ in 0..3 {
        assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);
    }

    let recipients: Vec<String> =
        p.notices.published().into_iter().map(|n| n.recipient_contact).collect();
    assert_eq!(recipients, vec!["j@x.com", "a@smith.org", "j@x.com"]);
}

#[tokio::test(start_paused = true)]
async fn test_workers_drain_then_stop_on_shutdown() {
    let p = Pipeline::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let enricher = p.enricher.clone();
    let enricher_shutdown = shutdown_rx.clone();
    let enricher_task = tokio::spawn(async move { enricher.run(enricher_shutdown).await });
    let notifier = p.notifier.clone();
    let notifier_task = tokio::spawn(async move { notifier.run(shutdown_rx).await });

    let trigger = p.capture("car.jpg", &["3ABC123"], "no_stop", "2024-05-01T10:00:00Z");
    p.detector.handle(&trigger).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.notices.published().len(), 1);

    shutdown_tx.send(true).unwrap();
    enricher_task.await.unwrap();
    notifier_task.await.unwrap();

    // Nothing consumes after shutdown
    let trigger = p.capture("late.jpg", &["7XYZ321"], "no_stop", "2024-05-01T11:00:00Z");
    p.detector.handle(&trigger).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(p.violations.depth().ready, 1);
    assert_eq!(p.notices.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_trigger_is_rejected() {
    let p = Pipeline::new();
    let err = p.detector.handle(&StorageEvent { records: vec![] }).await.unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(p.bus.published().is_empty());
    assert!(p.queues_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_detector_failure_still_notifies() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["3ABC123"], "no_stop", "2024-05-01T10:00:00Z");
    p.text.fail_next(2);

    let routed = p.detector.invoke(&trigger).await.unwrap();
    assert!(matches!(routed, RouteOutcome::Enqueued { duplicate: false, .. }));

    assert_eq!(p.enricher.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.notifier.poll_once().await.unwrap(), PollOutcome::Completed);
    assert_eq!(p.notices.published().len(), 1);
    assert!(p.dead_letters.letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_bus_outage_dead_letters_trigger() {
    let p = Pipeline::new();
    let trigger = p.capture("car.jpg", &["NEVADA"], "no_stop", "2024-05-01T10:00:00Z");
    p.bus.fail_next(3);

    let err = p.detector.invoke(&trigger).await.unwrap_err();
    assert!(err.is_transient());
    assert!(p.bus.published().is_empty());

    let letters = p.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, "detector");
    assert_eq!(letters[0].reason, RejectReason::RetriesExhausted);
    let replay: StorageEvent = serde_json::from_str(&letters[0].body).unwrap();
    assert_eq!(replay, trigger);
}
