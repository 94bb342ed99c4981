//! Metrics collection — fans out to independent sub-collectors on a fixed
//! interval and keeps a bounded ring buffer of recent snapshots.
//!
//! A failing or slow sub-collector degrades only its own fields; the tick
//! always produces a snapshot (partial-metrics policy).

use chrono::{DateTime, Duration, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::CollectorConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// One immutable sample of platform-wide metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub storage_load_pct: f64,
    pub connection_count: u32,
    pub connection_limit: u32,
    pub replication_lag_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate: f64,
    pub throughput_rps: f64,
    pub cache_hit_rate: f64,
    pub queue_depth: u64,
    pub memory_used_pct: f64,
    pub active_sessions: u64,
    pub disk_used_pct: f64,
}

impl MetricsSnapshot {
    /// Degraded defaults used when a sub-collector fails to report.
    pub fn degraded(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            storage_load_pct: 0.0,
            connection_count: 0,
            connection_limit: 0,
            replication_lag_ms: 0.0,
            latency_p50_ms: 0.0,
            latency_p95_ms: 0.0,
            latency_p99_ms: 0.0,
            error_rate: 0.0,
            throughput_rps: 0.0,
            cache_hit_rate: 1.0,
            queue_depth: 0,
            memory_used_pct: 0.0,
            active_sessions: 0,
            disk_used_pct: 0.0,
        }
    }

    fn apply(&mut self, patch: &MetricsPatch) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = patch.$field {
                    self.$field = v;
                }
            };
        }
        take!(storage_load_pct);
        take!(connection_count);
        take!(connection_limit);
        take!(replication_lag_ms);
        take!(latency_p50_ms);
        take!(latency_p95_ms);
        take!(latency_p99_ms);
        take!(error_rate);
        take!(throughput_rps);
        take!(cache_hit_rate);
        take!(queue_depth);
        take!(memory_used_pct);
        take!(active_sessions);
        take!(disk_used_pct);
    }
}

/// Partial metrics reported by a single sub-collector. Fields a source does
/// not own stay `None` and keep their degraded defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsPatch {
    pub storage_load_pct: Option<f64>,
    pub connection_count: Option<u32>,
    pub connection_limit: Option<u32>,
    pub replication_lag_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub error_rate: Option<f64>,
    pub throughput_rps: Option<f64>,
    pub cache_hit_rate: Option<f64>,
    pub queue_depth: Option<u64>,
    pub memory_used_pct: Option<f64>,
    pub active_sessions: Option<u64>,
    pub disk_used_pct: Option<f64>,
}

/// A sub-collector owning some subset of snapshot fields.
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn sample(&self) -> anyhow::Result<MetricsPatch>;
}

/// Source that always returns a fixed patch. Used in local mode and tests.
pub struct StaticSource {
    name: &'static str,
    patch: Mutex<MetricsPatch>,
}

impl StaticSource {
    pub fn new(name: &'static str, patch: MetricsPatch) -> Self {
        Self {
            name,
            patch: Mutex::new(patch),
        }
    }

    pub fn set(&self, patch: MetricsPatch) {
        *self.patch.lock() = patch;
    }
}

#[async_trait::async_trait]
impl MetricsSource for StaticSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn sample(&self) -> anyhow::Result<MetricsPatch> {
        Ok(self.patch.lock().clone())
    }
}

/// Collects snapshots from all registered sources and owns the ring buffer.
/// The buffer is exclusively written here; everyone else reads clones.
pub struct MetricsCollector {
    config: CollectorConfig,
    sources: Vec<Arc<dyn MetricsSource>>,
    ring: Mutex<VecDeque<MetricsSnapshot>>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl MetricsCollector {
    pub fn new(
        config: CollectorConfig,
        sources: Vec<Arc<dyn MetricsSource>>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let capacity = config.ring_capacity;
        Self {
            config,
            sources,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            clock,
            alerts,
        }
    }

    /// Run one collection tick: sample every source in parallel with a
    /// per-source timeout, merge into a snapshot, append to the ring buffer.
    pub async fn tick(&self) -> MetricsSnapshot {
        let now = self.clock.now();
        let mut snapshot = MetricsSnapshot::degraded(now);
        let timeout = std::time::Duration::from_millis(self.config.source_timeout_ms);

        let mut tasks = tokio::task::JoinSet::new();
        for source in &self.sources {
            let source = source.clone();
            tasks.spawn(async move {
                let name = source.name();
                match tokio::time::timeout(timeout, source.sample()).await {
                    Ok(Ok(patch)) => (name, Some(patch)),
                    Ok(Err(e)) => {
                        warn!(source = name, error = %e, "Sub-collector failed, fields degraded");
                        (name, None)
                    }
                    Err(_) => {
                        warn!(source = name, "Sub-collector timed out, fields degraded");
                        (name, None)
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Some(patch))) => snapshot.apply(&patch),
                Ok((name, None)) => {
                    metrics::counter!("collector.source_failures", "source" => name).increment(1)
                }
                Err(e) => warn!(error = %e, "Sub-collector task panicked, fields degraded"),
            }
        }

        self.check_anomalies(&snapshot);

        {
            let mut ring = self.ring.lock();
            if ring.len() == self.config.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(snapshot.clone());
        }

        metrics::gauge!("collector.error_rate").set(snapshot.error_rate);
        metrics::gauge!("collector.latency_p95_ms").set(snapshot.latency_p95_ms);
        debug!(
            storage_load = snapshot.storage_load_pct,
            error_rate = snapshot.error_rate,
            "Metrics snapshot collected"
        );
        snapshot
    }

    /// Latest snapshot, only if younger than one collection interval.
    /// Stale data is never served as current.
    pub fn latest(&self) -> Option<MetricsSnapshot> {
        let max_age = Duration::seconds(self.config.interval_secs as i64);
        let ring = self.ring.lock();
        let snapshot = ring.back()?;
        if self.clock.now() - snapshot.taken_at > max_age {
            return None;
        }
        Some(snapshot.clone())
    }

    /// Most recent `n` snapshots, oldest first.
    pub fn window(&self, n: usize) -> Vec<MetricsSnapshot> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Lightweight absolute-ceiling anomaly check, independent of the
    /// health-status machinery.
    fn check_anomalies(&self, snapshot: &MetricsSnapshot) {
        if snapshot.error_rate > self.config.error_rate_ceiling {
            self.alerts.emit(Alert::new(
                AlertSeverity::Critical,
                AlertCategory::Anomaly,
                format!(
                    "error rate {:.3} exceeds absolute ceiling {:.3}",
                    snapshot.error_rate, self.config.error_rate_ceiling
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::clock::ManualClock;

    fn test_config() -> CollectorConfig {
        CollectorConfig {
            interval_secs: 30,
            ring_capacity: 5,
            source_timeout_ms: 100,
            error_rate_ceiling: 0.25,
        }
    }

    fn storage_source(load: f64) -> Arc<dyn MetricsSource> {
        Arc::new(StaticSource::new(
            "storage",
            MetricsPatch {
                storage_load_pct: Some(load),
                connection_count: Some(40),
                connection_limit: Some(100),
                replication_lag_ms: Some(12.0),
                ..Default::default()
            },
        ))
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl MetricsSource for FailingSource {
        fn name(&self) -> &'static str {
            "request_path"
        }
        async fn sample(&self) -> anyhow::Result<MetricsPatch> {
            anyhow::bail!("probe unavailable")
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_never_exceeds_capacity() {
        let clock = Arc::new(ManualClock::starting_now());
        let collector = MetricsCollector::new(
            test_config(),
            vec![storage_source(42.0)],
            clock.clone(),
            capture_sink(),
        );

        for _ in 0..20 {
            collector.tick().await;
        }
        assert_eq!(collector.len(), 5);
    }

    #[tokio::test]
    async fn test_failing_source_degrades_only_its_fields() {
        let clock = Arc::new(ManualClock::starting_now());
        let collector = MetricsCollector::new(
            test_config(),
            vec![storage_source(55.0), Arc::new(FailingSource)],
            clock,
            capture_sink(),
        );

        let snapshot = collector.tick().await;
        assert_eq!(snapshot.storage_load_pct, 55.0);
        // request-path fields fall back to degraded defaults
        assert_eq!(snapshot.latency_p95_ms, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
    }

    #[tokio::test]
    async fn test_latest_expires_after_one_interval() {
        let clock = Arc::new(ManualClock::starting_now());
        let collector = MetricsCollector::new(
            test_config(),
            vec![storage_source(10.0)],
            clock.clone(),
            capture_sink(),
        );

        collector.tick().await;
        assert!(collector.latest().is_some());

        clock.advance(Duration::seconds(31));
        assert!(collector.latest().is_none());
    }

    #[tokio::test]
    async fn test_error_rate_ceiling_emits_anomaly_alert() {
        let clock = Arc::new(ManualClock::starting_now());
        let sink = capture_sink();
        let source = Arc::new(StaticSource::new(
            "request_path",
            MetricsPatch {
                error_rate: Some(0.4),
                ..Default::default()
            },
        ));
        let collector = MetricsCollector::new(test_config(), vec![source], clock, sink.clone());

        collector.tick().await;
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Anomaly);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }
}
