//! Health evaluation — deterministic mapping from the latest metrics
//! snapshot to per-subsystem status via a static threshold table.
//!
//! Status transitions are edge-triggered: an alert fires only when a
//! subsystem's level differs from the previous evaluation, so a subsystem
//! parked at `critical` raises exactly one alert, not one per tick.

use crate::collector::{MetricsCollector, MetricsSnapshot};
use chrono::{DateTime, Duration, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::HealthConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity, HealthLevel, Subsystem};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Direction in which a metric degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Degrades {
    Above,
    Below,
}

/// Warning/critical bounds for one metric of one subsystem.
#[derive(Debug, Clone, Copy)]
pub struct Bound {
    warning: f64,
    critical: f64,
    degrades: Degrades,
}

impl Bound {
    fn level(&self, value: f64) -> HealthLevel {
        match self.degrades {
            Degrades::Above => {
                if value >= self.critical {
                    HealthLevel::Critical
                } else if value >= self.warning {
                    HealthLevel::Warning
                } else {
                    HealthLevel::Healthy
                }
            }
            Degrades::Below => {
                if value <= self.critical {
                    HealthLevel::Critical
                } else if value <= self.warning {
                    HealthLevel::Warning
                } else {
                    HealthLevel::Healthy
                }
            }
        }
    }
}

/// Static per-subsystem threshold table.
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    pub storage_load: Bound,
    pub replication_lag: Bound,
    pub api_latency_p95: Bound,
    pub api_error_rate: Bound,
    pub cache_hit_rate: Bound,
    pub queue_depth: Bound,
    pub worker_memory: Bound,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            storage_load: Bound {
                warning: 65.0,
                critical: 80.0,
                degrades: Degrades::Above,
            },
            replication_lag: Bound {
                warning: 500.0,
                critical: 2000.0,
                degrades: Degrades::Above,
            },
            api_latency_p95: Bound {
                warning: 500.0,
                critical: 1500.0,
                degrades: Degrades::Above,
            },
            api_error_rate: Bound {
                warning: 0.05,
                critical: 0.10,
                degrades: Degrades::Above,
            },
            cache_hit_rate: Bound {
                warning: 0.80,
                critical: 0.50,
                degrades: Degrades::Below,
            },
            queue_depth: Bound {
                warning: 5_000.0,
                critical: 20_000.0,
                degrades: Degrades::Above,
            },
            worker_memory: Bound {
                warning: 80.0,
                critical: 92.0,
                degrades: Degrades::Above,
            },
        }
    }
}

impl ThresholdTable {
    /// Pure function: snapshot -> status for one subsystem. A subsystem
    /// with multiple bound metrics takes the worst of them.
    pub fn evaluate_subsystem(&self, subsystem: Subsystem, s: &MetricsSnapshot) -> HealthLevel {
        match subsystem {
            Subsystem::Storage => self
                .storage_load
                .level(s.storage_load_pct)
                .max(self.replication_lag.level(s.replication_lag_ms)),
            Subsystem::Api => self
                .api_latency_p95
                .level(s.latency_p95_ms)
                .max(self.api_error_rate.level(s.error_rate)),
            Subsystem::Cache => self.cache_hit_rate.level(s.cache_hit_rate),
            Subsystem::Queue => self.queue_depth.level(s.queue_depth as f64),
            Subsystem::Workers => self.worker_memory.level(s.memory_used_pct),
        }
    }

    /// Pure function: snapshot -> full report. Overall is the max severity
    /// across subsystems.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> HealthReport {
        let per_subsystem: HashMap<Subsystem, HealthLevel> = Subsystem::ALL
            .iter()
            .map(|&sub| (sub, self.evaluate_subsystem(sub, snapshot)))
            .collect();
        let overall = per_subsystem
            .values()
            .copied()
            .max()
            .unwrap_or(HealthLevel::Healthy);

        HealthReport {
            evaluated_at: snapshot.taken_at,
            per_subsystem,
            overall,
        }
    }
}

/// Result of one health evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub evaluated_at: DateTime<Utc>,
    pub per_subsystem: HashMap<Subsystem, HealthLevel>,
    pub overall: HealthLevel,
}

/// An observed status change for one subsystem (or the overall status,
/// carried with `subsystem = None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthTransition {
    pub subsystem: Option<Subsystem>,
    pub from: HealthLevel,
    pub to: HealthLevel,
    pub at: DateTime<Utc>,
}

impl HealthTransition {
    pub fn is_to_critical(&self) -> bool {
        self.to == HealthLevel::Critical
    }
}

struct CurrentStatus {
    report: HealthReport,
    stored_at: DateTime<Utc>,
}

/// Stateful evaluator: holds the previous report for edge detection and the
/// TTL'd current status served to the dashboard.
pub struct HealthEvaluator {
    config: HealthConfig,
    table: ThresholdTable,
    current: Mutex<Option<CurrentStatus>>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl HealthEvaluator {
    pub fn new(
        config: HealthConfig,
        table: ThresholdTable,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            table,
            current: Mutex::new(None),
            clock,
            alerts,
        }
    }

    /// Evaluate the collector's latest snapshot. Returns `None` when no
    /// fresh snapshot is available (never evaluates stale data).
    pub fn tick(&self, collector: &MetricsCollector) -> Option<(HealthReport, Vec<HealthTransition>)> {
        let snapshot = collector.latest()?;
        let report = self.table.evaluate(&snapshot);
        let transitions = self.observe(report.clone());
        Some((report, transitions))
    }

    /// Record a new report, compare against the previous one, and emit one
    /// alert per changed status.
    pub fn observe(&self, report: HealthReport) -> Vec<HealthTransition> {
        let now = self.clock.now();
        let mut current = self.current.lock();

        let mut transitions = Vec::new();
        let previous = current.as_ref().map(|c| &c.report);

        for &subsystem in &Subsystem::ALL {
            let to = report.per_subsystem[&subsystem];
            let from = previous
                .and_then(|p| p.per_subsystem.get(&subsystem).copied())
                .unwrap_or(HealthLevel::Healthy);
            if from != to {
                transitions.push(HealthTransition {
                    subsystem: Some(subsystem),
                    from,
                    to,
                    at: now,
                });
            }
        }

        let overall_from = previous.map(|p| p.overall).unwrap_or(HealthLevel::Healthy);
        if overall_from != report.overall {
            transitions.push(HealthTransition {
                subsystem: None,
                from: overall_from,
                to: report.overall,
                at: now,
            });
        }

        *current = Some(CurrentStatus {
            report,
            stored_at: now,
        });
        drop(current);

        for transition in &transitions {
            let severity = match transition.to {
                HealthLevel::Healthy => AlertSeverity::Info,
                HealthLevel::Warning => AlertSeverity::Warning,
                HealthLevel::Critical => AlertSeverity::Critical,
            };
            let target = transition
                .subsystem
                .map(|s| s.as_str())
                .unwrap_or("overall");
            self.alerts.emit(Alert::new(
                severity,
                AlertCategory::Health,
                format!(
                    "{} status changed {} -> {}",
                    target,
                    transition.from.as_str(),
                    transition.to.as_str()
                ),
            ));
            metrics::counter!("health.transitions", "target" => target).increment(1);
        }

        debug!(transitions = transitions.len(), "Health evaluation recorded");
        transitions
    }

    /// Current status, if it has not outlived its TTL.
    pub fn current(&self) -> Option<HealthReport> {
        let current = self.current.lock();
        let status = current.as_ref()?;
        let ttl = Duration::seconds(self.config.status_ttl_secs as i64);
        if self.clock.now() - status.stored_at > ttl {
            return None;
        }
        Some(status.report.clone())
    }

    /// Overall status right now; `None` when the status has gone stale.
    pub fn overall(&self) -> Option<HealthLevel> {
        self.current().map(|r| r.overall)
    }
}
