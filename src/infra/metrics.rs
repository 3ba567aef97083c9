//! Lock-free pipeline metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering intentionally; these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Message handling latency bucket boundaries (milliseconds)
/// Buckets: ≤1, ≤2, ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, >1000
const BUCKET_BOUNDS: [u64; 10] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector shared by all stages
pub struct Metrics {
    started_at: Instant,
    /// Storage triggers handled by the detector
    images_processed: AtomicU64,
    /// Triggers rejected as malformed
    validation_failures: AtomicU64,
    /// Detector invocations failed on a collaborator call
    detector_failures: AtomicU64,
    routed_in_jurisdiction: AtomicU64,
    routed_out_of_jurisdiction: AtomicU64,
    /// Sends suppressed by a queue's dedup window
    duplicates_suppressed: AtomicU64,
    messages_received: AtomicU64,
    enriched_published: AtomicU64,
    plate_misses: AtomicU64,
    notices_published: AtomicU64,
    unknown_violation_types: AtomicU64,
    dead_lettered: AtomicU64,
    left_for_redelivery: AtomicU64,
    poll_errors: AtomicU64,
    /// Message handling latency histogram (ms)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    latency_sum_ms: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            images_processed: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            detector_failures: AtomicU64::new(0),
            routed_in_jurisdiction: AtomicU64::new(0),
            routed_out_of_jurisdiction: AtomicU64::new(0),
            duplicates_suppressed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            enriched_published: AtomicU64::new(0),
            plate_misses: AtomicU64::new(0),
            notices_published: AtomicU64::new(0),
            unknown_violation_types: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            left_for_redelivery: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
            latency_buckets: Default::default(),
            latency_sum_ms: AtomicU64::new(0),
        }
    }

    pub fn record_image_processed(&self) {
        self.images_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detector_failure(&self) {
        self.detector_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self, in_jurisdiction: bool) {
        if in_jurisdiction {
            self.routed_in_jurisdiction.fetch_add(1, Ordering::Relaxed);
        } else {
            self.routed_out_of_jurisdiction.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enriched(&self) {
        self.enriched_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_plate_miss(&self) {
        self.plate_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notice_published(&self) {
        self.notices_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_violation_type(&self) {
        self.unknown_violation_types.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_left_for_redelivery(&self) {
        self.left_for_redelivery.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time from receive to terminal state for one message
    pub fn record_handling_latency(&self, latency_ms: u64) {
        self.latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Consistent-enough snapshot of all counters (monotonic, never reset)
    pub fn report(&self) -> MetricsSummary {
        let lat_buckets = load_buckets(&self.latency_buckets);
        let handled: u64 = lat_buckets.iter().sum();
        let latency_sum_ms = self.latency_sum_ms.load(Ordering::Relaxed);

        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            images_processed: self.images_processed.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
            routed_in_jurisdiction: self.routed_in_jurisdiction.load(Ordering::Relaxed),
            routed_out_of_jurisdiction: self.routed_out_of_jurisdiction.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            enriched_published: self.enriched_published.load(Ordering::Relaxed),
            plate_misses: self.plate_misses.load(Ordering::Relaxed),
            notices_published: self.notices_published.load(Ordering::Relaxed),
            unknown_violation_types: self.unknown_violation_types.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            left_for_redelivery: self.left_for_redelivery.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            lat_buckets,
            lat_sum_ms: latency_sum_ms,
            lat_avg_ms: if handled > 0 { latency_sum_ms / handled } else { 0 },
            lat_p50_ms: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_ms: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub images_processed: u64,
    pub validation_failures: u64,
    pub detector_failures: u64,
    pub routed_in_jurisdiction: u64,
    pub routed_out_of_jurisdiction: u64,
    pub duplicates_suppressed: u64,
    pub messages_received: u64,
    pub enriched_published: u64,
    pub plate_misses: u64,
    pub notices_published: u64,
    pub unknown_violation_types: u64,
    pub dead_lettered: u64,
    pub left_for_redelivery: u64,
    pub poll_errors: u64,
    /// Bounds: ≤1, ≤2, ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, >1000 ms
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_sum_ms: u64,
    pub lat_avg_ms: u64,
    pub lat_p50_ms: u64,
    pub lat_p99_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            images = %self.images_processed,
            routed_in = %self.routed_in_jurisdiction,
            routed_out = %self.routed_out_of_jurisdiction,
            received = %self.messages_received,
            enriched = %self.enriched_published,
            notices = %self.notices_published,
            plate_misses = %self.plate_misses,
            unknown_types = %self.unknown_violation_types,
            dead_lettered = %self.dead_lettered,
            redelivery = %self.left_for_redelivery,
            duplicates = %self.duplicates_suppressed,
            p99_ms = %self.lat_p99_ms,
            "metrics"
        );
    }
}
