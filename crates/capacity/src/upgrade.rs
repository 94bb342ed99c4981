//! Seven-phase tier-upgrade state machine. Each phase is retried a bounded
//! number of times; a phase that stays failed rolls the upgrade back to the
//! last committed tier and escalates.

use crate::planner::{CapacityPlanner, CapacityTier};
use chrono::{DateTime, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity};
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use ledgerpilot_remediation::executor::InfrastructureExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Attempts per phase before the upgrade rolls back.
const PHASE_ATTEMPTS: u32 = 2;

/// Per-attempt timeout on executor calls.
const PHASE_TIMEOUT: Duration = Duration::from_secs(60);

/// Worker-pool delta provisioned for the next tier.
const UPGRADE_WORKER_STEP: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    ValidatePreconditions,
    ProvisionReadReplica,
    ProvisionConnectionPool,
    ProvisionCacheCluster,
    ProvisionWorkerPool,
    EnableAsyncProcessing,
    CommitTier,
}

impl UpgradePhase {
    pub const ORDER: [UpgradePhase; 7] = [
        UpgradePhase::ValidatePreconditions,
        UpgradePhase::ProvisionReadReplica,
        UpgradePhase::ProvisionConnectionPool,
        UpgradePhase::ProvisionCacheCluster,
        UpgradePhase::ProvisionWorkerPool,
        UpgradePhase::EnableAsyncProcessing,
        UpgradePhase::CommitTier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidatePreconditions => "validate_preconditions",
            Self::ProvisionReadReplica => "provision_read_replica",
            Self::ProvisionConnectionPool => "provision_connection_pool",
            Self::ProvisionCacheCluster => "provision_cache_cluster",
            Self::ProvisionWorkerPool => "provision_worker_pool",
            Self::EnableAsyncProcessing => "enable_async_processing",
            Self::CommitTier => "commit_tier",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UpgradeState {
    Committed,
    RolledBack {
        failed_phase: UpgradePhase,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeOutcome {
    pub id: Uuid,
    pub from_tier: String,
    pub to_tier: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_phases: Vec<UpgradePhase>,
    pub state: UpgradeState,
}

pub struct TierUpgrader {
    executor: Arc<dyn InfrastructureExecutor>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl TierUpgrader {
    pub fn new(
        executor: Arc<dyn InfrastructureExecutor>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            alerts,
            audit,
            clock,
        }
    }

    /// Run the full upgrade to the planner's next tier. Only a completed
    /// `CommitTier` phase switches the planner; any earlier failure leaves
    /// the committed tier untouched.
    pub async fn upgrade(&self, planner: &CapacityPlanner) -> UpgradeOutcome {
        let from = planner.current_tier();
        let id = Uuid::new_v4();
        let started_at = self.clock.now();

        let Some(to) = from.next() else {
            let state = UpgradeState::RolledBack {
                failed_phase: UpgradePhase::ValidatePreconditions,
                error: format!("tier {} has no successor", from.name),
            };
            return self.finish(id, from, from, started_at, Vec::new(), state);
        };

        info!(upgrade = %id, from = from.name, to = to.name, "Starting tier upgrade");
        self.audit.append(
            "system",
            "tier_upgrade_started",
            "capacity",
            serde_json::json!({ "upgrade_id": id, "from": from.name, "to": to.name }),
        );

        let mut completed = Vec::new();
        for phase in UpgradePhase::ORDER {
            match self.run_phase(phase, from, to, planner).await {
                Ok(()) => {
                    self.audit.append(
                        "system",
                        "tier_upgrade_phase_completed",
                        "capacity",
                        serde_json::json!({ "upgrade_id": id, "phase": phase.as_str() }),
                    );
                    completed.push(phase);
                }
                Err(err) => {
                    let state = UpgradeState::RolledBack {
                        failed_phase: phase,
                        error: err.to_string(),
                    };
                    self.rollback(id, from, phase, &err);
                    return self.finish(id, from, to, started_at, completed, state);
                }
            }
        }

        self.alerts.emit(Alert::new(
            AlertSeverity::Info,
            AlertCategory::Capacity,
            format!("tier upgrade committed: {} -> {}", from.name, to.name),
        ));
        self.finish(id, from, to, started_at, completed, UpgradeState::Committed)
    }

    /// Execute one phase with bounded retries and per-attempt timeout.
    async fn run_phase(
        &self,
        phase: UpgradePhase,
        from: CapacityTier,
        to: CapacityTier,
        planner: &CapacityPlanner,
    ) -> ControlPlaneResult<()> {
        let mut last_err = None;
        for attempt in 1..=PHASE_ATTEMPTS {
            let result = match tokio::time::timeout(
                PHASE_TIMEOUT,
                self.execute_phase(phase, from, to, planner),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ControlPlaneError::Timeout(format!(
                    "upgrade phase {} after {}s",
                    phase.as_str(),
                    PHASE_TIMEOUT.as_secs()
                ))),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        phase = phase.as_str(),
                        attempt,
                        error = %err,
                        "Upgrade phase attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ControlPlaneError::Internal(anyhow::anyhow!("phase failed with no recorded error"))
        }))
    }

    async fn execute_phase(
        &self,
        phase: UpgradePhase,
        from: CapacityTier,
        to: CapacityTier,
        planner: &CapacityPlanner,
    ) -> ControlPlaneResult<()> {
        match phase {
            UpgradePhase::ValidatePreconditions => {
                if to.tenant_limit <= from.tenant_limit {
                    return Err(ControlPlaneError::Validation(format!(
                        "target tier {} does not raise the tenant limit",
                        to.name
                    )));
                }
                Ok(())
            }
            UpgradePhase::ProvisionReadReplica => self.executor.provision_read_replica().await,
            UpgradePhase::ProvisionConnectionPool => {
                self.executor.provision_connection_pool().await
            }
            UpgradePhase::ProvisionCacheCluster => self.executor.provision_caching_layer().await,
            UpgradePhase::ProvisionWorkerPool => {
                self.executor.scale_workers(UPGRADE_WORKER_STEP).await
            }
            UpgradePhase::EnableAsyncProcessing => {
                self.executor.restart_service("async-processor").await
            }
            UpgradePhase::CommitTier => {
                planner.commit_tier(to);
                Ok(())
            }
        }
    }

    fn rollback(&self, id: Uuid, from: CapacityTier, phase: UpgradePhase, err: &ControlPlaneError) {
        warn!(
            upgrade = %id,
            phase = phase.as_str(),
            error = %err,
            "Tier upgrade failed; rolling back to committed tier"
        );
        self.audit.append(
            "system",
            "tier_upgrade_rolled_back",
            "capacity",
            serde_json::json!({
                "upgrade_id": id,
                "failed_phase": phase.as_str(),
                "error": err.to_string(),
                "committed_tier": from.name,
            }),
        );
        self.alerts.emit(Alert::new(
            AlertSeverity::Page,
            AlertCategory::Capacity,
            format!(
                "tier upgrade rolled back at {} ({}); still on {}",
                phase.as_str(),
                err,
                from.name
            ),
        ));
    }

    fn finish(
        &self,
        id: Uuid,
        from: CapacityTier,
        to: CapacityTier,
        started_at: DateTime<Utc>,
        completed_phases: Vec<UpgradePhase>,
        state: UpgradeState,
    ) -> UpgradeOutcome {
        metrics::counter!(
            "capacity.tier_upgrades",
            "outcome" => match state {
                UpgradeState::Committed => "committed",
                UpgradeState::RolledBack { .. } => "rolled_back",
            }
        )
        .increment(1);

        UpgradeOutcome {
            id,
            from_tier: from.name.to_string(),
            to_tier: to.name.to_string(),
            started_at,
            finished_at: self.clock.now(),
            completed_phases,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::CapacityPlanner;
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::clock::ManualClock;
    use ledgerpilot_core::config::CapacityConfig;
    use ledgerpilot_remediation::executor::{ExecutorCall, RecordingExecutor};

    fn planner(executor: Arc<RecordingExecutor>, tier: &str) -> CapacityPlanner {
        CapacityPlanner::new(
            CapacityConfig::default(),
            CapacityTier::by_name(tier).unwrap(),
            executor,
            ledgerpilot_core::alerts::noop_sink(),
            Arc::new(AuditLog::new()),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn upgrader(executor: Arc<RecordingExecutor>) -> (TierUpgrader, Arc<ledgerpilot_core::alerts::CaptureSink>, Arc<AuditLog>) {
        let alerts = capture_sink();
        let audit = Arc::new(AuditLog::new());
        let upgrader = TierUpgrader::new(
            executor,
            alerts.clone(),
            audit.clone(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        (upgrader, alerts, audit)
    }

    #[tokio::test]
    async fn test_happy_path_commits_all_seven_phases() {
        let executor = Arc::new(RecordingExecutor::new());
        let planner = planner(executor.clone(), "growth");
        let (upgrader, _, audit) = upgrader(executor.clone());

        let outcome = upgrader.upgrade(&planner).await;
        assert_eq!(outcome.state, UpgradeState::Committed);
        assert_eq!(outcome.completed_phases, UpgradePhase::ORDER.to_vec());
        assert_eq!(planner.current_tier().name, "scale");

        let phases = audit.by_component("capacity", 20);
        assert!(phases.iter().any(|e| e.action == "tier_upgrade_started"));
        assert_eq!(
            phases
                .iter()
                .filter(|e| e.action == "tier_upgrade_phase_completed")
                .count(),
            7
        );
    }

    #[tokio::test]
    async fn test_phase_failure_rolls_back_and_pages() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.fail_on("provision_caching_layer");
        let planner = planner(executor.clone(), "growth");
        let (upgrader, alerts, audit) = upgrader(executor.clone());

        let outcome = upgrader.upgrade(&planner).await;
        match outcome.state {
            UpgradeState::RolledBack { failed_phase, .. } => {
                assert_eq!(failed_phase, UpgradePhase::ProvisionCacheCluster);
            }
            other => panic!("expected rollback, got {other:?}"),
        }
        assert_eq!(planner.current_tier().name, "growth");
        assert_eq!(alerts.count_severity(AlertSeverity::Page), 1);
        assert!(audit
            .entries()
            .iter()
            .any(|e| e.action == "tier_upgrade_rolled_back"));
    }

    #[tokio::test]
    async fn test_phase_is_retried_before_rollback() {
        struct FlakyExecutor {
            inner: RecordingExecutor,
            failures_left: parking_lot::Mutex<u32>,
        }

        #[async_trait::async_trait]
        impl InfrastructureExecutor for FlakyExecutor {
            async fn scale_workers(&self, delta: i32) -> ControlPlaneResult<()> {
                self.inner.scale_workers(delta).await
            }
            async fn restart_service(&self, name: &str) -> ControlPlaneResult<()> {
                self.inner.restart_service(name).await
            }
            async fn terminate_long_running_operations(
                &self,
                threshold_secs: u64,
            ) -> ControlPlaneResult<()> {
                self.inner.terminate_long_running_operations(threshold_secs).await
            }
            async fn provision_read_replica(&self) -> ControlPlaneResult<()> {
                {
                    let mut left = self.failures_left.lock();
                    if *left > 0 {
                        *left -= 1;
                        return Err(ControlPlaneError::Executor("transient".into()));
                    }
                }
                self.inner.provision_read_replica().await
            }
            async fn provision_caching_layer(&self) -> ControlPlaneResult<()> {
                self.inner.provision_caching_layer().await
            }
            async fn provision_connection_pool(&self) -> ControlPlaneResult<()> {
                self.inner.provision_connection_pool().await
            }
        }

        let executor = Arc::new(FlakyExecutor {
            inner: RecordingExecutor::new(),
            failures_left: parking_lot::Mutex::new(1),
        });
        let planner = CapacityPlanner::new(
            CapacityConfig::default(),
            CapacityTier::by_name("growth").unwrap(),
            executor.clone(),
            ledgerpilot_core::alerts::noop_sink(),
            Arc::new(AuditLog::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );
        let upgrader = TierUpgrader::new(
            executor,
            ledgerpilot_core::alerts::noop_sink(),
            Arc::new(AuditLog::new()),
            Arc::new(ManualClock::new(Utc::now())),
        );

        let outcome = upgrader.upgrade(&planner).await;
        assert_eq!(outcome.state, UpgradeState::Committed);
    }

    #[tokio::test]
    async fn test_top_tier_cannot_upgrade() {
        let executor = Arc::new(RecordingExecutor::new());
        let planner = planner(executor.clone(), "enterprise");
        let (upgrader, _, _) = upgrader(executor.clone());

        let outcome = upgrader.upgrade(&planner).await;
        assert!(matches!(outcome.state, UpgradeState::RolledBack { .. }));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commit_happens_last() {
        let executor = Arc::new(RecordingExecutor::new());
        executor.fail_on("restart_service"); // EnableAsyncProcessing fails
        let planner = planner(executor.clone(), "growth");
        let (upgrader, _, _) = upgrader(executor.clone());

        let outcome = upgrader.upgrade(&planner).await;
        assert!(matches!(outcome.state, UpgradeState::RolledBack { .. }));
        // All provisioning ran, but the tier never switched.
        assert!(executor.calls().contains(&ExecutorCall::ProvisionReadReplica));
        assert_eq!(planner.current_tier().name, "growth");
    }
}
