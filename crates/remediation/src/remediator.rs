//! Auto-remediation controller. Reacts to transition-to-critical health
//! events and to adverse latency trends, dispatching bounded actions
//! through the infrastructure executor.
//!
//! Dispatch for a given (subsystem, action) pair is serialized: concurrent
//! triggers collapse into one in-flight action. Two consecutive failures
//! for the same trigger escalate to a human instead of a third attempt.

use crate::executor::InfrastructureExecutor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::config::RemediationConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity, Subsystem};
use ledgerpilot_core::ControlPlaneError;
use ledgerpilot_telemetry::collector::MetricsSnapshot;
use ledgerpilot_telemetry::health::HealthTransition;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Threshold for the terminate-long-running-operations action.
const LONG_RUNNING_OP_THRESHOLD_SECS: u64 = 300;

/// Samples required before the proactive trend check speaks up.
const TREND_WINDOW: usize = 10;

/// Second-half latency must exceed first-half by this factor.
const TREND_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    DatabaseOptimization,
    CacheRefresh,
    WorkerScaleUp,
    ServiceRestart,
}

impl ActionType {
    /// The single remediation action matched to each subsystem.
    pub fn for_subsystem(subsystem: Subsystem) -> ActionType {
        match subsystem {
            Subsystem::Storage => ActionType::DatabaseOptimization,
            Subsystem::Cache => ActionType::CacheRefresh,
            Subsystem::Queue | Subsystem::Workers => ActionType::WorkerScaleUp,
            Subsystem::Api => ActionType::ServiceRestart,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DatabaseOptimization => "database_optimization",
            Self::CacheRefresh => "cache_refresh",
            Self::WorkerScaleUp => "worker_scale_up",
            Self::ServiceRestart => "service_restart",
        }
    }
}

/// One dispatched action, success or failure. Append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub subsystem: Subsystem,
    pub trigger: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

pub struct AutoRemediator {
    config: RemediationConfig,
    executor: Arc<dyn InfrastructureExecutor>,
    in_flight: DashMap<(Subsystem, ActionType), ()>,
    consecutive_failures: DashMap<String, u32>,
    history: Mutex<VecDeque<RemediationAction>>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
}

impl AutoRemediator {
    pub fn new(
        config: RemediationConfig,
        executor: Arc<dyn InfrastructureExecutor>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            executor,
            in_flight: DashMap::new(),
            consecutive_failures: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            alerts,
            audit,
        }
    }

    /// Reactive path: called for every health transition; acts only on
    /// transitions into `critical`.
    pub async fn on_transition(&self, transition: &HealthTransition) -> Option<RemediationAction> {
        if !transition.is_to_critical() {
            return None;
        }
        let subsystem = transition.subsystem?;
        let trigger = format!("{}_critical", subsystem.as_str());
        self.remediate(subsystem, &trigger).await
    }

    /// Proactive path: inspect a sliding window of recent snapshots for a
    /// worsening latency trend and pre-scale workers before the threshold
    /// table would flag anything.
    pub async fn observe_window(&self, window: &[MetricsSnapshot]) -> Option<RemediationAction> {
        if window.len() < TREND_WINDOW {
            return None;
        }
        let recent = &window[window.len() - TREND_WINDOW..];
        let half = TREND_WINDOW / 2;
        let first: f64 = recent[..half].iter().map(|s| s.latency_p95_ms).sum::<f64>() / half as f64;
        let second: f64 =
            recent[half..].iter().map(|s| s.latency_p95_ms).sum::<f64>() / (TREND_WINDOW - half) as f64;

        if second > first * TREND_RATIO && second >= self.config.trend_latency_floor_ms {
            info!(
                first_half_ms = first,
                second_half_ms = second,
                "Adverse latency trend detected, pre-scaling workers"
            );
            return self.remediate(Subsystem::Workers, "latency_trend").await;
        }
        None
    }

    /// Dispatch the matching action for a subsystem. Returns `None` when the
    /// action was debounced or escalated instead of dispatched.
    pub async fn remediate(&self, subsystem: Subsystem, trigger: &str) -> Option<RemediationAction> {
        let action_type = ActionType::for_subsystem(subsystem);

        // Two-strike rule: after two consecutive failures the same trigger
        // goes to a human, not to a third attempt.
        if self
            .consecutive_failures
            .get(trigger)
            .map(|c| *c >= 2)
            .unwrap_or(false)
        {
            self.consecutive_failures.remove(trigger);
            self.alerts.emit(Alert::new(
                AlertSeverity::Page,
                AlertCategory::Remediation,
                format!("remediation for '{trigger}' failed twice, escalating to operator"),
            ));
            metrics::counter!("remediation.escalations").increment(1);
            return None;
        }

        // Per-(subsystem, action) debounce: if one is already in flight,
        // this trigger collapses into it.
        let key = (subsystem, action_type);
        if self.in_flight.insert(key, ()).is_some() {
            metrics::counter!("remediation.debounced").increment(1);
            return None;
        }

        let started = Instant::now();
        let timeout = std::time::Duration::from_millis(self.config.action_timeout_ms);
        let result = match tokio::time::timeout(timeout, self.execute(action_type)).await {
            Ok(result) => result,
            Err(_) => Err(ControlPlaneError::Timeout(format!(
                "{} did not finish within {}ms",
                action_type.as_str(),
                self.config.action_timeout_ms
            ))),
        };
        self.in_flight.remove(&key);

        let duration_ms = started.elapsed().as_millis() as u64;
        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        let action = RemediationAction {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action_type,
            subsystem,
            trigger: trigger.to_string(),
            success,
            duration_ms,
            error,
        };

        if success {
            self.consecutive_failures.remove(trigger);
            info!(
                action = action_type.as_str(),
                subsystem = %subsystem,
                duration_ms,
                "Remediation action succeeded"
            );
        } else {
            let mut failures = self.consecutive_failures.entry(trigger.to_string()).or_insert(0);
            *failures += 1;
            warn!(
                action = action_type.as_str(),
                subsystem = %subsystem,
                failures = *failures,
                error = action.error.as_deref().unwrap_or("unknown"),
                "Remediation action failed"
            );
            self.alerts.emit(Alert::new(
                AlertSeverity::Warning,
                AlertCategory::Remediation,
                format!(
                    "remediation '{}' for '{}' failed: {}",
                    action_type.as_str(),
                    trigger,
                    action.error.as_deref().unwrap_or("unknown")
                ),
            ));
        }

        self.audit.append(
            "system",
            format!("remediation_{}", action_type.as_str()),
            "remediation",
            serde_json::json!({
                "subsystem": subsystem.as_str(),
                "trigger": trigger,
                "success": success,
                "duration_ms": duration_ms,
            }),
        );

        metrics::counter!("remediation.actions", "type" => action_type.as_str()).increment(1);
        metrics::gauge!("remediation.success_rate").set(self.push_and_rate(action.clone()));

        Some(action)
    }

    async fn execute(&self, action_type: ActionType) -> ledgerpilot_core::ControlPlaneResult<()> {
        match action_type {
            ActionType::DatabaseOptimization => {
                self.executor
                    .terminate_long_running_operations(LONG_RUNNING_OP_THRESHOLD_SECS)
                    .await
            }
            ActionType::CacheRefresh => self.executor.restart_service("cache").await,
            ActionType::WorkerScaleUp => {
                // Delta is capped by configuration; the executor enforces the
                // absolute pool ceiling.
                self.executor.scale_workers(self.config.max_scale_step as i32).await
            }
            ActionType::ServiceRestart => self.executor.restart_service("api-gateway").await,
        }
    }

    fn push_and_rate(&self, action: RemediationAction) -> f64 {
        let mut history = self.history.lock();
        if history.len() == self.config.success_window {
            history.pop_front();
        }
        history.push_back(action);
        let successes = history.iter().filter(|a| a.success).count();
        successes as f64 / history.len() as f64
    }

    /// Rolling auto-fix success rate over the configured window. Reported,
    /// not enforced.
    pub fn success_rate(&self) -> f64 {
        let history = self.history.lock();
        if history.is_empty() {
            return 1.0;
        }
        let successes = history.iter().filter(|a| a.success).count();
        successes as f64 / history.len() as f64
    }

    /// Most recent actions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RemediationAction> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorCall, RecordingExecutor};
    use chrono::Utc;
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::types::HealthLevel;

    fn remediator(executor: Arc<RecordingExecutor>) -> (AutoRemediator, Arc<ledgerpilot_core::alerts::CaptureSink>) {
        let sink = capture_sink();
        let remediator = AutoRemediator::new(
            RemediationConfig {
                action_timeout_ms: 1000,
                max_scale_step: 4,
                success_window: 100,
                trend_latency_floor_ms: 200.0,
            },
            executor,
            sink.clone(),
            Arc::new(AuditLog::new()),
        );
        (remediator, sink)
    }

    fn storage_critical() -> HealthTransition {
        HealthTransition {
            subsystem: Some(Subsystem::Storage),
            from: HealthLevel::Healthy,
            to: HealthLevel::Critical,
            at: Utc::now(),
        }
    }

    fn trend_snapshot(latency_p95_ms: f64) -> MetricsSnapshot {
        let mut s = MetricsSnapshot::degraded(Utc::now());
        s.latency_p95_ms = latency_p95_ms;
        s
    }

    #[tokio::test]
    async fn test_storage_critical_dispatches_database_optimization() {
        let executor = Arc::new(RecordingExecutor::new());
        let (remediator, _) = remediator(executor.clone());

        let action = remediator.on_transition(&storage_critical()).await.unwrap();
        assert_eq!(action.action_type, ActionType::DatabaseOptimization);
        assert!(action.success);

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            calls[0],
            ExecutorCall::TerminateLongRunningOperations { .. }
        ));
    }

    #[tokio::test]
    async fn test_non_critical_transition_is_ignored() {
        let executor = Arc::new(RecordingExecutor::new());
        let (remediator, _) = remediator(executor.clone());

        let transition = HealthTransition {
            subsystem: Some(Subsystem::Api),
            from: HealthLevel::Healthy,
            to: HealthLevel::Warning,
            at: Utc::now(),
        };
        assert!(remediator.on_transition(&transition).await.is_none());
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_recorded_then_two_strike_escalation() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.fail_on("terminate_long_running_operations");
        let (remediator, sink) = remediator(executor.clone());

        // Two failed attempts are recorded.
        let first = remediator.remediate(Subsystem::Storage, "storage_critical").await.unwrap();
        assert!(!first.success);
        let second = remediator.remediate(Subsystem::Storage, "storage_critical").await.unwrap();
        assert!(!second.success);

        // Third trigger escalates instead of retrying.
        let third = remediator.remediate(Subsystem::Storage, "storage_critical").await;
        assert!(third.is_none());
        assert_eq!(sink.count_severity(AlertSeverity::Page), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.fail_on("terminate_long_running_operations");
        let (remediator, sink) = remediator(executor.clone());

        remediator.remediate(Subsystem::Storage, "storage_critical").await;
        executor.clear_failures();
        let action = remediator.remediate(Subsystem::Storage, "storage_critical").await.unwrap();
        assert!(action.success);

        // Streak reset: a later failure starts counting from one again.
        executor.fail_on("terminate_long_running_operations");
        remediator.remediate(Subsystem::Storage, "storage_critical").await;
        let next = remediator.remediate(Subsystem::Storage, "storage_critical").await;
        assert!(next.is_some(), "second failure should still attempt, not escalate");
        assert_eq!(sink.count_severity(AlertSeverity::Page), 0);
    }

    #[tokio::test]
    async fn test_latency_trend_triggers_prescale() {
        let executor = Arc::new(RecordingExecutor::new());
        let (remediator, _) = remediator(executor.clone());

        let mut window: Vec<MetricsSnapshot> =
            (0..5).map(|_| trend_snapshot(100.0)).collect();
        window.extend((0..5).map(|_| trend_snapshot(400.0)));

        let action = remediator.observe_window(&window).await.unwrap();
        assert_eq!(action.action_type, ActionType::WorkerScaleUp);
        assert_eq!(
            executor.calls(),
            vec![ExecutorCall::ScaleWorkers { delta: 4 }]
        );
    }

    #[tokio::test]
    async fn test_trend_below_floor_stays_quiet() {
        let executor = Arc::new(RecordingExecutor::new());
        let (remediator, _) = remediator(executor.clone());

        // 10 -> 40ms is a 4x degradation but far below the absolute floor.
        let mut window: Vec<MetricsSnapshot> = (0..5).map(|_| trend_snapshot(10.0)).collect();
        window.extend((0..5).map(|_| trend_snapshot(40.0)));

        assert!(remediator.observe_window(&window).await.is_none());
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_success_rate_tracks_window() {
        let executor = Arc::new(RecordingExecutor::new());
        let (remediator, _) = remediator(executor.clone());

        remediator.remediate(Subsystem::Cache, "cache_critical").await;
        executor.fail_on("restart_service");
        remediator.remediate(Subsystem::Api, "api_critical").await;

        assert_eq!(remediator.success_rate(), 0.5);
        assert_eq!(remediator.recent(10).len(), 2);
    }
}
