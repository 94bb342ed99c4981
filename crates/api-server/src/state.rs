//! The control-plane context object. Every component is constructed once
//! here and handed to collaborators by reference; there is no ambient
//! global state. Also builds the aggregated dashboard snapshot and feeds
//! the push channel.

use chrono::{DateTime, Utc};
use ledgerpilot_capacity::planner::{CapacityPlanner, CapacityStatus, CapacityTier};
use ledgerpilot_capacity::upgrade::{TierUpgrader, UpgradeOutcome};
use ledgerpilot_core::alerts::{AlertLog, AlertSink};
use ledgerpilot_core::audit::{AuditEntry, AuditLog};
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::AppConfig;
use ledgerpilot_core::types::{Alert, HealthLevel, TenantId};
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use ledgerpilot_deployment::flags::{FeatureFlag, FeatureFlagManager, FlagScope};
use ledgerpilot_deployment::kill_switch::{KillSwitch, KillSwitches, SwitchRecord, WriteGate};
use ledgerpilot_deployment::migrations::{
    Migration, MigrationExecutor, MigrationPhase, MigrationRunner,
};
use ledgerpilot_integrity::freeze::{FreezeRecord, FrozenTenantSet};
use ledgerpilot_integrity::store::LedgerStore;
use ledgerpilot_integrity::validator::{Escalation, FinancialIntegrityValidator, ValidationResult};
use ledgerpilot_remediation::executor::InfrastructureExecutor;
use ledgerpilot_remediation::remediator::{AutoRemediator, RemediationAction};
use ledgerpilot_telemetry::collector::{MetricsCollector, MetricsSnapshot, MetricsSource};
use ledgerpilot_telemetry::health::{HealthEvaluator, HealthReport, ThresholdTable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Alerts retained in the dashboard history.
const ALERT_LOG_CAPACITY: usize = 500;

/// Push-channel buffer; slow subscribers drop old snapshots, never block.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Serialize)]
pub struct RemediationSummary {
    pub success_rate: f64,
    pub recent: Vec<RemediationAction>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegritySummary {
    pub recent_results: Vec<ValidationResult>,
    pub escalations: Vec<Escalation>,
    pub frozen_tenants: Vec<FreezeRecord>,
    pub audit_chain_intact: bool,
}

/// The read-only aggregate pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub node_id: String,
    pub metrics: Option<MetricsSnapshot>,
    pub health: Option<HealthReport>,
    pub remediation: RemediationSummary,
    pub integrity: IntegritySummary,
    pub capacity: CapacityStatus,
    pub flags: Vec<FeatureFlag>,
    pub migrations: Vec<Migration>,
    pub kill_switches: Vec<SwitchRecord>,
    pub alerts: Vec<Alert>,
}

/// Compact status line for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub node_id: String,
    pub overall_health: Option<HealthLevel>,
    pub capacity_utilization_pct: f64,
    pub frozen_tenants: usize,
    pub pending_escalations: usize,
    pub armed_kill_switches: Vec<KillSwitch>,
    pub remediation_success_rate: f64,
}

#[derive(Debug, Deserialize)]
pub struct CreateFlagRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub scope: FlagScope,
    pub accounting_safe: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum FlagUpdateRequest {
    Resume,
    Disable,
}

#[derive(Debug, Deserialize)]
pub struct MigrationRequest {
    pub group: String,
    pub phase: MigrationPhase,
    #[serde(default)]
    pub description: String,
    pub script: String,
    pub rollback_script: String,
    /// Register only when false; register and run when true.
    #[serde(default = "default_run")]
    pub run: bool,
}

fn default_run() -> bool {
    true
}

pub struct ControlPlane {
    pub config: AppConfig,
    pub clock: Arc<dyn Clock>,
    pub collector: Arc<MetricsCollector>,
    pub health: Arc<HealthEvaluator>,
    pub remediator: Arc<AutoRemediator>,
    pub validator: Arc<FinancialIntegrityValidator>,
    pub planner: Arc<CapacityPlanner>,
    pub upgrader: Arc<TierUpgrader>,
    pub flags: Arc<FeatureFlagManager>,
    pub migrations: Arc<MigrationRunner>,
    pub switches: Arc<KillSwitches>,
    pub write_gate: Arc<WriteGate>,
    pub frozen: Arc<FrozenTenantSet>,
    pub ledger: Arc<dyn LedgerStore>,
    pub audit: Arc<AuditLog>,
    pub alert_log: Arc<AlertLog>,
    snapshots: broadcast::Sender<DashboardSnapshot>,
}

impl ControlPlane {
    /// Wire every component once against the shared audit log, alert log,
    /// and frozen-tenant set.
    pub fn build(
        config: AppConfig,
        sources: Vec<Arc<dyn MetricsSource>>,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn InfrastructureExecutor>,
        migration_executor: Arc<dyn MigrationExecutor>,
        clock: Arc<dyn Clock>,
        starting_tier: CapacityTier,
    ) -> Arc<Self> {
        let audit = Arc::new(AuditLog::new());
        let alert_log = Arc::new(AlertLog::new(ALERT_LOG_CAPACITY));
        let alerts: Arc<dyn AlertSink> = alert_log.clone();
        let frozen = Arc::new(FrozenTenantSet::new(clock.clone()));

        let collector = Arc::new(MetricsCollector::new(
            config.collector.clone(),
            sources,
            clock.clone(),
            alerts.clone(),
        ));
        let health = Arc::new(HealthEvaluator::new(
            config.health.clone(),
            ThresholdTable::default(),
            clock.clone(),
            alerts.clone(),
        ));
        let remediator = Arc::new(AutoRemediator::new(
            config.remediation.clone(),
            executor.clone(),
            alerts.clone(),
            audit.clone(),
        ));
        let validator = Arc::new(FinancialIntegrityValidator::new(
            config.integrity.clone(),
            ledger.clone(),
            frozen.clone(),
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let planner = Arc::new(CapacityPlanner::new(
            config.capacity.clone(),
            starting_tier,
            executor.clone(),
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let upgrader = Arc::new(TierUpgrader::new(
            executor,
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let flags = Arc::new(FeatureFlagManager::new(
            config.deployment.clone(),
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let migrations = Arc::new(MigrationRunner::new(
            migration_executor,
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let switches = Arc::new(KillSwitches::new(
            config.deployment.clone(),
            alerts,
            audit.clone(),
            clock.clone(),
        ));
        let write_gate = Arc::new(WriteGate::new(switches.clone(), frozen.clone()));
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Arc::new(Self {
            config,
            clock,
            collector,
            health,
            remediator,
            validator,
            planner,
            upgrader,
            flags,
            migrations,
            switches,
            write_gate,
            frozen,
            ledger,
            audit,
            alert_log,
            snapshots,
        })
    }

    // --- command surface (one method per API endpoint) ---

    /// Start the canary rollout of a flag.
    pub fn deploy(&self, flag_name: &str, actor: &str) -> ControlPlaneResult<FeatureFlag> {
        info!(flag = flag_name, actor, "Deploy requested");
        self.flags.start_rollout(flag_name)
    }

    pub fn create_flag(&self, req: CreateFlagRequest) -> ControlPlaneResult<FeatureFlag> {
        self.flags
            .create(req.name, req.description, req.scope, req.accounting_safe)
    }

    pub fn update_flag(
        &self,
        name: &str,
        req: FlagUpdateRequest,
        actor: &str,
    ) -> ControlPlaneResult<FeatureFlag> {
        match req {
            FlagUpdateRequest::Resume => self.flags.resume(name, actor),
            FlagUpdateRequest::Disable => self.flags.disable(name, actor),
        }
    }

    pub async fn run_migration(
        &self,
        req: MigrationRequest,
        actor: &str,
    ) -> ControlPlaneResult<Migration> {
        let migration = self.migrations.register(
            req.group,
            req.phase,
            req.description,
            req.script,
            req.rollback_script,
        );
        if req.run {
            self.migrations.run(migration.id, actor).await
        } else {
            Ok(migration)
        }
    }

    pub async fn rollback_migration(&self, id: Uuid, actor: &str) -> ControlPlaneResult<Migration> {
        self.migrations.rollback(id, actor).await
    }

    pub fn emergency_stop(
        &self,
        actor: &str,
        reason: &str,
        confirmation: Option<&str>,
    ) -> ControlPlaneResult<SwitchRecord> {
        self.switches
            .arm(KillSwitch::EmergencyStop, actor, reason, confirmation)
    }

    pub fn freeze_tenant(
        &self,
        tenant: TenantId,
        reason: &str,
        actor: &str,
    ) -> ControlPlaneResult<FreezeRecord> {
        self.frozen.freeze(
            tenant,
            reason,
            self.config.integrity.freeze_ttl_secs,
        );
        self.audit.append(
            actor,
            "tenant_frozen",
            "api",
            serde_json::json!({ "tenant_id": tenant, "reason": reason }),
        );
        self.frozen
            .record(tenant)
            .ok_or_else(|| ControlPlaneError::Internal(anyhow::anyhow!("freeze record vanished")))
    }

    /// Manual unfreeze. Requires every integrity check to pass for the
    /// tenant first; a tenant that is still failing stays frozen.
    pub async fn unfreeze_tenant(&self, tenant: TenantId, actor: &str) -> ControlPlaneResult<()> {
        if !self.frozen.is_frozen(tenant) {
            return Err(ControlPlaneError::NotFound(format!(
                "tenant {tenant} is not frozen"
            )));
        }
        if !self.validator.revalidate_tenant(tenant).await? {
            return Err(ControlPlaneError::Validation(format!(
                "tenant {tenant} still fails integrity checks; unfreeze refused"
            )));
        }
        self.frozen.unfreeze(tenant);
        self.audit.append(
            actor,
            "tenant_unfrozen",
            "api",
            serde_json::json!({ "tenant_id": tenant, "via": "manual" }),
        );
        Ok(())
    }

    /// Run the tier-upgrade state machine to the planner's next tier.
    pub async fn upgrade_tier(&self) -> UpgradeOutcome {
        self.upgrader.upgrade(&self.planner).await
    }

    // --- read surface ---

    pub fn status(&self) -> StatusSummary {
        StatusSummary {
            node_id: self.config.node_id.clone(),
            overall_health: self.health.overall(),
            capacity_utilization_pct: self.planner.utilization_pct(),
            frozen_tenants: self.frozen.len(),
            pending_escalations: self.validator.escalations().len(),
            armed_kill_switches: self.switches.active().iter().map(|r| r.switch).collect(),
            remediation_success_rate: self.remediator.success_rate(),
        }
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            generated_at: self.clock.now(),
            node_id: self.config.node_id.clone(),
            metrics: self.collector.latest(),
            health: self.health.current(),
            remediation: RemediationSummary {
                success_rate: self.remediator.success_rate(),
                recent: self.remediator.recent(20),
            },
            integrity: IntegritySummary {
                recent_results: self.validator.recent_results(20),
                escalations: self.validator.escalations(),
                frozen_tenants: self.frozen.active(),
                audit_chain_intact: self.audit.verify_chain().chain_intact,
            },
            capacity: self.planner.status(),
            flags: self.flags.list(),
            migrations: self.migrations.list(),
            kill_switches: self.switches.active(),
            alerts: self.alert_log.recent(50),
        }
    }

    /// Build a snapshot and push it to every subscriber.
    pub fn publish_snapshot(&self) -> DashboardSnapshot {
        let snapshot = self.snapshot();
        // Send fails only when nobody is subscribed; that's fine.
        let _ = self.snapshots.send(snapshot.clone());
        snapshot
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        self.audit.recent(limit)
    }
}
