//! Configuration loading from TOML files
//!
//! Config file is selected via the --config command line argument
//! (default: config/dev.toml). Every section is optional and falls back
//! to its defaults.

use crate::domain::fines::{default_fines, FineSchedule};
use crate::domain::notice::DEFAULT_TIME_ZONE;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Site identifier used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "pipeline".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// How long a QoS 1 publish may wait for its PUBACK
    #[serde(default = "default_mqtt_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            ack_timeout_ms: default_mqtt_ack_timeout_ms(),
        }
    }
}

fn default_mqtt_ack_timeout_ms() -> u64 {
    5000
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Start the embedded broker in-process
    #[serde(default = "default_broker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_broker_enabled(),
            bind_address: default_broker_bind_address(),
            port: default_mqtt_port(),
        }
    }
}

fn default_broker_enabled() -> bool {
    true
}

fn default_broker_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Root directory; each subdirectory is a bucket
    #[serde(default = "default_object_store_dir")]
    pub dir: String,
    /// Bucket watched for new images
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            dir: default_object_store_dir(),
            bucket: default_bucket(),
            image_extension: default_image_extension(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

fn default_object_store_dir() -> String {
    "data/objects".to_string()
}

fn default_bucket() -> String {
    "traffic-violations".to_string()
}

fn default_image_extension() -> String {
    "jpg".to_string()
}

fn default_scan_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_url")]
    pub url: String,
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
    /// Invocations per trigger before it is dead-lettered (at least 1)
    #[serde(default = "default_detector_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay, doubled on each further attempt
    #[serde(default = "default_detector_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: default_detector_url(),
            timeout_ms: default_detector_timeout_ms(),
            max_attempts: default_detector_max_attempts(),
            retry_backoff_ms: default_detector_retry_backoff_ms(),
        }
    }
}

fn default_detector_max_attempts() -> u32 {
    3
}

fn default_detector_retry_backoff_ms() -> u64 {
    1000
}

fn default_detector_url() -> String {
    "http://localhost:8085/detect-text".to_string()
}

fn default_detector_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: String,
    /// 0 = check the file on every lookup
    #[serde(default)]
    pub staleness_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { path: default_registry_path(), staleness_ms: 0 }
    }
}

fn default_registry_path() -> String {
    "config/registry.toml".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Message group for in-jurisdiction violations
    #[serde(default = "default_violation_group_id")]
    pub violation_group_id: String,
    /// Message group for enriched violations
    #[serde(default = "default_enriched_group_id")]
    pub enriched_group_id: String,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Long-poll bound per receive
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    /// Dead-letter after this many receives (0 = unbounded)
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            violation_group_id: default_violation_group_id(),
            enriched_group_id: default_enriched_group_id(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            wait_secs: default_wait_secs(),
            dedup_window_secs: default_dedup_window_secs(),
            max_receive_count: default_max_receive_count(),
        }
    }
}

fn default_violation_group_id() -> String {
    "violations".to_string()
}

fn default_enriched_group_id() -> String {
    "enriched".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_wait_secs() -> u64 {
    20
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_max_receive_count() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_bus_name")]
    pub name: String,
    #[serde(default = "default_bus_source")]
    pub source: String,
    #[serde(default = "default_detail_type")]
    pub detail_type: String,
    #[serde(default = "default_bus_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            name: default_bus_name(),
            source: default_bus_source(),
            detail_type: default_detail_type(),
            topic_prefix: default_bus_topic_prefix(),
        }
    }
}

fn default_bus_name() -> String {
    "out-of-jurisdiction".to_string()
}

fn default_bus_source() -> String {
    "custom.imageProcessing".to_string()
}

fn default_detail_type() -> String {
    "Image Processed".to_string()
}

fn default_bus_topic_prefix() -> String {
    "pipeline/bus".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_notification_topic")]
    pub topic: String,
    /// IANA zone that notice dates are rendered in
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { topic: default_notification_topic(), time_zone: default_time_zone() }
    }
}

fn default_notification_topic() -> String {
    "pipeline/notices".to_string()
}

fn default_time_zone() -> String {
    DEFAULT_TIME_ZONE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterConfig {
    /// File path for rejected messages (JSONL format)
    #[serde(default = "default_dead_letter_file")]
    pub file: String,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { file: default_dead_letter_file() }
    }
}

fn default_dead_letter_file() -> String {
    "dead_letters.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_replicas")]
    pub enricher_replicas: usize,
    #[serde(default = "default_replicas")]
    pub notifier_replicas: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { enricher_replicas: default_replicas(), notifier_replicas: default_replicas() }
    }
}

fn default_replicas() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval_secs(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

fn default_metrics_interval_secs() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    /// violation type -> amount in dollars
    #[serde(default = "default_fines")]
    pub fines: HashMap<String, u32>,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    mqtt_ack_timeout_ms: u64,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    object_store_dir: String,
    bucket: String,
    image_extension: String,
    scan_interval_ms: u64,
    detector_url: String,
    detector_timeout_ms: u64,
    detector_max_attempts: u32,
    detector_retry_backoff_ms: u64,
    registry_path: String,
    registry_staleness_ms: u64,
    violation_group_id: String,
    enriched_group_id: String,
    visibility_timeout_secs: u64,
    wait_secs: u64,
    dedup_window_secs: u64,
    max_receive_count: u32,
    bus_name: String,
    bus_source: String,
    bus_detail_type: String,
    bus_topic_prefix: String,
    notification_topic: String,
    time_zone: String,
    fines: HashMap<String, u32>,
    dead_letter_file: String,
    enricher_replicas: usize,
    notifier_replicas: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_ack_timeout_ms: toml_config.mqtt.ack_timeout_ms,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            object_store_dir: toml_config.object_store.dir,
            bucket: toml_config.object_store.bucket,
            image_extension: toml_config.object_store.image_extension,
            scan_interval_ms: toml_config.object_store.scan_interval_ms,
            detector_url: toml_config.detector.url,
            detector_timeout_ms: toml_config.detector.timeout_ms,
            detector_max_attempts: toml_config.detector.max_attempts.max(1),
            detector_retry_backoff_ms: toml_config.detector.retry_backoff_ms,
            registry_path: toml_config.registry.path,
            registry_staleness_ms: toml_config.registry.staleness_ms,
            violation_group_id: toml_config.queues.violation_group_id,
            enriched_group_id: toml_config.queues.enriched_group_id,
            visibility_timeout_secs: toml_config.queues.visibility_timeout_secs,
            wait_secs: toml_config.queues.wait_secs,
            dedup_window_secs: toml_config.queues.dedup_window_secs,
            max_receive_count: toml_config.queues.max_receive_count,
            bus_name: toml_config.event_bus.name,
            bus_source: toml_config.event_bus.source,
            bus_detail_type: toml_config.event_bus.detail_type,
            bus_topic_prefix: toml_config.event_bus.topic_prefix,
            notification_topic: toml_config.notification.topic,
            time_zone: toml_config.notification.time_zone,
            fines: toml_config.fines,
            dead_letter_file: toml_config.dead_letter.file,
            enricher_replicas: toml_config.workers.enricher_replicas,
            notifier_replicas: toml_config.workers.notifier_replicas,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Fine schedule built from the `[fines]` table
    pub fn fine_schedule(&self) -> FineSchedule {
        FineSchedule::new(self.fines.clone())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn mqtt_ack_timeout_ms(&self) -> u64 {
        self.mqtt_ack_timeout_ms
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn object_store_dir(&self) -> &str {
        &self.object_store_dir
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn image_extension(&self) -> &str {
        &self.image_extension
    }

    pub fn scan_interval_ms(&self) -> u64 {
        self.scan_interval_ms
    }

    pub fn detector_url(&self) -> &str {
        &self.detector_url
    }

    pub fn detector_timeout_ms(&self) -> u64 {
        self.detector_timeout_ms
    }

    pub fn detector_max_attempts(&self) -> u32 {
        self.detector_max_attempts
    }

    pub fn detector_retry_backoff_ms(&self) -> u64 {
        self.detector_retry_backoff_ms
    }

    pub fn registry_path(&self) -> &str {
        &self.registry_path
    }

    pub fn registry_staleness_ms(&self) -> u64 {
        self.registry_staleness_ms
    }

    pub fn violation_group_id(&self) -> &str {
        &self.violation_group_id
    }

    pub fn enriched_group_id(&self) -> &str {
        &self.enriched_group_id
    }

    pub fn visibility_timeout_secs(&self) -> u64 {
        self.visibility_timeout_secs
    }

    pub fn wait_secs(&self) -> u64 {
        self.wait_secs
    }

    pub fn dedup_window_secs(&self) -> u64 {
        self.dedup_window_secs
    }

    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn bus_source(&self) -> &str {
        &self.bus_source
    }

    pub fn bus_detail_type(&self) -> &str {
        &self.bus_detail_type
    }

    pub fn bus_topic_prefix(&self) -> &str {
        &self.bus_topic_prefix
    }

    pub fn notification_topic(&self) -> &str {
        &self.notification_topic
    }

    pub fn time_zone(&self) -> &str {
        &self.time_zone
    }

    pub fn dead_letter_file(&self) -> &str {
        &self.dead_letter_file
    }

    pub fn enricher_replicas(&self) -> usize {
        self.enricher_replicas
    }

    pub fn notifier_replicas(&self) -> usize {
        self.notifier_replicas
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
