//! Metrics collection
//!
//! Commutative counters plus windowed aggregates: a one-minute sliding
//! average response time, a one-second operations gauge, a bounded buffer
//! of recent data points for ad-hoc summaries, and hourly buckets covering
//! up to a week. Threshold descriptors are evaluated on every ingested
//! data point and breaches surface as `MetricThresholdExceeded` events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use rescache_core::{epoch_millis, CacheEvent, EventSink, NoopSink};

/// Data points buffered for ad-hoc summaries
const BUFFER_CAPACITY: usize = 10_000;

/// Hourly buckets retained (one week)
const HOURLY_HORIZON: usize = 7 * 24;

/// Sliding window width of the average response time
const LATENCY_WINDOW: Duration = Duration::from_secs(60);

/// Window width of the operations gauge
const OPS_WINDOW: Duration = Duration::from_secs(1);

/// Comparison operator of a threshold descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    /// Breach when the current value rises above the threshold
    Above,
    /// Breach when the current value falls below the threshold
    Below,
}

impl ThresholdOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOp::Above => ">",
            ThresholdOp::Below => "<",
        }
    }

    fn breached(&self, current: f64, threshold: f64) -> bool {
        match self {
            ThresholdOp::Above => current > threshold,
            ThresholdOp::Below => current < threshold,
        }
    }
}

/// A metric threshold watched on every ingested data point
#[derive(Debug, Clone)]
pub struct ThresholdDescriptor {
    pub metric: String,
    pub operator: ThresholdOp,
    pub value: f64,
    pub enabled: bool,
}

impl ThresholdDescriptor {
    pub fn new(metric: impl Into<String>, operator: ThresholdOp, value: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            value,
            enabled: true,
        }
    }
}

fn default_thresholds() -> Vec<ThresholdDescriptor> {
    vec![
        ThresholdDescriptor::new("hit_rate", ThresholdOp::Below, 0.5),
        ThresholdDescriptor::new("avg_response_time_ms", ThresholdOp::Above, 100.0),
        ThresholdDescriptor::new("error_count", ThresholdOp::Above, 10.0),
        ThresholdDescriptor::new("memory_bytes", ThresholdOp::Above, 100.0 * 1024.0 * 1024.0),
    ]
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
    errors: u64,
    bytes_held: u64,
}

#[derive(Debug, Default)]
struct EntityCounters {
    hits: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy)]
struct DataPoint {
    at: Instant,
    duration: Duration,
    hit: bool,
    error: bool,
}

/// One hour of aggregated history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourBucket {
    /// Hours since the Unix epoch
    pub hour: u64,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub total_latency: Duration,
    pub operations: u64,
}

impl HourBucket {
    /// Average operation latency inside this hour
    pub fn avg_latency(&self) -> Duration {
        if self.operations == 0 {
            Duration::ZERO
        } else {
            self.total_latency / self.operations as u32
        }
    }

    /// Start of the bucket's hour
    pub fn start(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.hour * 3600)
    }
}

/// Per-entity hit statistics in a snapshot
#[derive(Debug, Clone, Default)]
pub struct EntityMetrics {
    pub hits: u64,
    pub misses: u64,
}

impl EntityMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Point-in-time view of all collected metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub errors: u64,
    pub bytes_held: u64,
    pub hit_rate: f64,
    /// Average response time over the last minute
    pub avg_response_time: Duration,
    /// Operations observed in the last second
    pub ops_per_second: u64,
    pub per_entity: HashMap<String, EntityMetrics>,
}

/// Ad-hoc summary over the buffered data points
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub window: Duration,
    pub operations: u64,
    pub hit_rate: f64,
    pub error_count: u64,
    pub avg_duration: Duration,
    pub max_duration: Duration,
}

/// Metrics collector
///
/// All counters are commutative; exact interleaving of concurrent updates
/// is immaterial. When disabled every record call is a no-op.
pub struct MetricsCollector {
    enabled: bool,
    sink: Arc<dyn EventSink>,
    counters: RwLock<Counters>,
    per_entity: DashMap<String, EntityCounters>,
    buffer: Mutex<VecDeque<DataPoint>>,
    hourly: Mutex<VecDeque<HourBucket>>,
    thresholds: RwLock<Vec<ThresholdDescriptor>>,
}

impl MetricsCollector {
    pub fn new(enabled: bool, sink: Arc<dyn EventSink>) -> Self {
        Self {
            enabled,
            sink,
            counters: RwLock::new(Counters::default()),
            per_entity: DashMap::new(),
            buffer: Mutex::new(VecDeque::with_capacity(1024)),
            hourly: Mutex::new(VecDeque::new()),
            thresholds: RwLock::new(default_thresholds()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, Arc::new(NoopSink))
    }

    /// Replace the watched thresholds
    pub fn set_thresholds(&self, thresholds: Vec<ThresholdDescriptor>) {
        *self.thresholds.write() = thresholds;
    }

    pub fn record_hit(&self, entity_type: &str, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.counters.write().hits += 1;
        self.per_entity
            .entry(entity_type.to_string())
            .or_default()
            .hits += 1;
        self.ingest(DataPoint {
            at: Instant::now(),
            duration,
            hit: true,
            error: false,
        });
    }

    pub fn record_miss(&self, entity_type: &str, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.counters.write().misses += 1;
        self.per_entity
            .entry(entity_type.to_string())
            .or_default()
            .misses += 1;
        self.ingest(DataPoint {
            at: Instant::now(),
            duration,
            hit: false,
            error: false,
        });
    }

    pub fn record_set(&self, bytes: usize, duration: Duration) {
        if !self.enabled {
            return;
        }
        {
            let mut counters = self.counters.write();
            counters.sets += 1;
            counters.bytes_held += bytes as u64;
        }
        self.ingest(DataPoint {
            at: Instant::now(),
            duration,
            hit: false,
            error: false,
        });
    }

    pub fn record_delete(&self, count: u64) {
        if !self.enabled {
            return;
        }
        self.counters.write().deletes += count;
    }

    pub fn record_eviction(&self, count: u64) {
        if !self.enabled {
            return;
        }
        self.counters.write().evictions += count;
    }

    pub fn record_error(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.counters.write().errors += 1;
        self.ingest(DataPoint {
            at: Instant::now(),
            duration,
            hit: false,
            error: true,
        });
    }

    /// Track the byte usage reported by the store
    pub fn record_store_bytes(&self, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.counters.write().bytes_held = bytes as u64;
    }

    fn ingest(&self, point: DataPoint) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() == BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(point);
        }
        self.aggregate_hourly(&point);
        self.evaluate_thresholds();
    }

    fn aggregate_hourly(&self, point: &DataPoint) {
        let hour = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            / 3600;
        let mut hourly = self.hourly.lock();
        let needs_new = hourly.back().map(|b| b.hour != hour).unwrap_or(true);
        if needs_new {
            hourly.push_back(HourBucket {
                hour,
                hits: 0,
                misses: 0,
                errors: 0,
                total_latency: Duration::ZERO,
                operations: 0,
            });
            if hourly.len() > HOURLY_HORIZON {
                hourly.pop_front();
            }
        }
        let bucket = hourly.back_mut().expect("bucket pushed above");
        bucket.operations += 1;
        bucket.total_latency += point.duration;
        if point.error {
            bucket.errors += 1;
        } else if point.hit {
            bucket.hits += 1;
        } else {
            bucket.misses += 1;
        }
    }

    fn evaluate_thresholds(&self) {
        let snapshot = self.snapshot();
        let thresholds = self.thresholds.read();
        for threshold in thresholds.iter().filter(|t| t.enabled) {
            let current = match threshold.metric.as_str() {
                "hit_rate" => {
                    // Meaningless before any reads happened.
                    if snapshot.hits + snapshot.misses == 0 {
                        continue;
                    }
                    snapshot.hit_rate
                }
                "avg_response_time_ms" => snapshot.avg_response_time.as_secs_f64() * 1000.0,
                "error_count" => snapshot.errors as f64,
                "memory_bytes" => snapshot.bytes_held as f64,
                _ => continue,
            };
            if threshold.operator.breached(current, threshold.value) {
                self.sink.emit(&CacheEvent::MetricThresholdExceeded {
                    metric: threshold.metric.clone(),
                    operator: threshold.operator.as_str().to_string(),
                    value: threshold.value,
                    current_value: current,
                    timestamp_ms: epoch_millis(),
                });
            }
        }
    }

    /// Current values of every counter and gauge
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read();
        let total = counters.hits + counters.misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            counters.hits as f64 / total as f64
        };

        let (avg_response_time, ops_per_second) = {
            let buffer = self.buffer.lock();
            let now = Instant::now();
            let mut latency_sum = Duration::ZERO;
            let mut latency_count = 0u64;
            let mut ops = 0u64;
            for point in buffer.iter().rev() {
                let age = now.duration_since(point.at);
                if age > LATENCY_WINDOW {
                    break;
                }
                latency_sum += point.duration;
                latency_count += 1;
                if age <= OPS_WINDOW {
                    ops += 1;
                }
            }
            let avg = if latency_count == 0 {
                Duration::ZERO
            } else {
                latency_sum / latency_count as u32
            };
            (avg, ops)
        };

        MetricsSnapshot {
            hits: counters.hits,
            misses: counters.misses,
            sets: counters.sets,
            deletes: counters.deletes,
            evictions: counters.evictions,
            errors: counters.errors,
            bytes_held: counters.bytes_held,
            hit_rate,
            avg_response_time,
            ops_per_second,
            per_entity: self
                .per_entity
                .iter()
                .map(|item| {
                    (
                        item.key().clone(),
                        EntityMetrics {
                            hits: item.value().hits,
                            misses: item.value().misses,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Hourly aggregates, oldest first, covering up to one week
    pub fn hourly_buckets(&self) -> Vec<HourBucket> {
        self.hourly.lock().iter().copied().collect()
    }

    /// Summarize the buffered data points inside `window`
    pub fn summary(&self, window: Duration) -> MetricsSummary {
        let buffer = self.buffer.lock();
        let now = Instant::now();
        let mut operations = 0u64;
        let mut hits = 0u64;
        let mut reads = 0u64;
        let mut errors = 0u64;
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        for point in buffer.iter().rev() {
            if now.duration_since(point.at) > window {
                break;
            }
            operations += 1;
            total += point.duration;
            max = max.max(point.duration);
            if point.error {
                errors += 1;
            } else {
                reads += 1;
                if point.hit {
                    hits += 1;
                }
            }
        }
        MetricsSummary {
            window,
            operations,
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
            error_count: errors,
            avg_duration: if operations == 0 {
                Duration::ZERO
            } else {
                total / operations as u32
            },
            max_duration: max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(true, Arc::new(NoopSink))
    }

    #[test]
    fn test_hit_rate() {
        let metrics = collector();
        for _ in 0..8 {
            metrics.record_hit("companies", Duration::from_millis(1));
        }
        for _ in 0..2 {
            metrics.record_miss("companies", Duration::from_millis(5));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 8);
        assert_eq!(snapshot.misses, 2);
        assert!((snapshot.hit_rate - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_per_entity_counters() {
        let metrics = collector();
        metrics.record_hit("companies", Duration::from_millis(1));
        metrics.record_miss("tickets", Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.per_entity["companies"].hits, 1);
        assert_eq!(snapshot.per_entity["tickets"].misses, 1);
        assert!((snapshot.per_entity["companies"].hit_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let metrics = MetricsCollector::disabled();
        metrics.record_hit("companies", Duration::from_millis(1));
        metrics.record_error(Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 0);
        assert_eq!(snapshot.errors, 0);
    }

    #[test]
    fn test_avg_response_time_window() {
        let metrics = collector();
        metrics.record_hit("companies", Duration::from_millis(10));
        metrics.record_hit("companies", Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_response_time, Duration::from_millis(15));
        assert_eq!(snapshot.ops_per_second, 2);
    }

    #[test]
    fn test_threshold_event_fires() {
        let seen: Arc<StdMutex<Vec<CacheEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let metrics = MetricsCollector::new(
            true,
            Arc::new(move |event: &CacheEvent| {
                sink_seen.lock().unwrap().push(event.clone());
            }),
        );
        metrics.set_thresholds(vec![ThresholdDescriptor::new(
            "error_count",
            ThresholdOp::Above,
            2.0,
        )]);

        for _ in 0..4 {
            metrics.record_error(Duration::from_millis(1));
        }

        let events = seen.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            CacheEvent::MetricThresholdExceeded { metric, .. } if metric == "error_count"
        )));
    }

    #[test]
    fn test_hit_rate_threshold_skipped_without_reads() {
        let seen: Arc<StdMutex<Vec<CacheEvent>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let metrics = MetricsCollector::new(
            true,
            Arc::new(move |event: &CacheEvent| {
                sink_seen.lock().unwrap().push(event.clone());
            }),
        );

        metrics.record_set(10, Duration::from_millis(1));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_summary() {
        let metrics = collector();
        metrics.record_hit("companies", Duration::from_millis(10));
        metrics.record_miss("companies", Duration::from_millis(30));
        metrics.record_error(Duration::from_millis(5));

        let summary = metrics.summary(Duration::from_secs(60));
        assert_eq!(summary.operations, 3);
        assert_eq!(summary.error_count, 1);
        assert!((summary.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.avg_duration, Duration::from_millis(15));
        assert_eq!(summary.max_duration, Duration::from_millis(30));
    }

    #[test]
    fn test_hourly_buckets_aggregate_history() {
        let metrics = collector();
        for _ in 0..3 {
            metrics.record_hit("companies", Duration::from_millis(10));
        }
        metrics.record_miss("companies", Duration::from_millis(40));
        metrics.record_error(Duration::from_millis(10));

        // All five points land in the current hour (two buckets only if
        // the test straddles an hour boundary).
        let buckets = metrics.hourly_buckets();
        assert!(!buckets.is_empty());
        let hits: u64 = buckets.iter().map(|b| b.hits).sum();
        let misses: u64 = buckets.iter().map(|b| b.misses).sum();
        let errors: u64 = buckets.iter().map(|b| b.errors).sum();
        let operations: u64 = buckets.iter().map(|b| b.operations).sum();
        assert_eq!(hits, 3);
        assert_eq!(misses, 1);
        assert_eq!(errors, 1);
        assert_eq!(operations, 5);

        let current = buckets.last().unwrap();
        assert!(current.avg_latency() > Duration::ZERO);
        assert!(current.start() <= SystemTime::now());
    }

    #[test]
    fn test_buffer_is_bounded() {
        let metrics = collector();
        for _ in 0..(BUFFER_CAPACITY + 100) {
            metrics.record_hit("companies", Duration::from_micros(1));
        }
        assert!(metrics.buffer.lock().len() <= BUFFER_CAPACITY);
    }
}
