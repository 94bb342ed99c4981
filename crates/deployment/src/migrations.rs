//! Expand/migrate/contract schema migrations.
//!
//! Every migration declares one phase and a paired rollback script. Phases
//! execute independently and are individually retryable; a contract phase
//! refuses to run until the expand and migrate phases of its group are
//! confirmed complete. The `migrate` phase is batch-resumable: the executor
//! returns a cursor and the runner keeps calling until it reports done.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity};
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Per-batch timeout on executor calls.
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Additive change, deployed before the consuming code.
    Expand,
    /// Idempotent, batch-resumable data transform.
    Migrate,
    /// Destructive removal; only after expand and migrate are done.
    Contract,
}

impl MigrationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expand => "expand",
            Self::Migrate => "migrate",
            Self::Contract => "contract",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum MigrationStatus {
    Pending,
    Running,
    Completed,
    Failed { error: String },
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Migration {
    pub id: Uuid,
    /// Migrations in one group form an expand/migrate/contract triple.
    pub group: String,
    pub phase: MigrationPhase,
    pub description: String,
    pub script: String,
    pub rollback_script: String,
    pub status: MigrationStatus,
    pub attempts: u32,
    /// Resume point for batch-resumable phases.
    pub batch_cursor: Option<u64>,
    pub registered_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Applies migration batches against the real schema. Out of scope here;
/// tests and local mode use the recording implementation.
#[async_trait::async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Apply one batch starting at `cursor`. Returns the next cursor, or
    /// `None` when the phase is fully applied. Must be idempotent.
    async fn apply_batch(
        &self,
        migration: &Migration,
        cursor: u64,
    ) -> ControlPlaneResult<Option<u64>>;

    /// Run the migration's paired rollback script.
    async fn rollback(&self, migration: &Migration) -> ControlPlaneResult<()>;
}

/// Executor that records scripts instead of running them. `batches` controls
/// how many apply calls a migrate phase takes; named scripts can be told to
/// fail for failure-path tests.
#[derive(Default)]
pub struct RecordingMigrationExecutor {
    applied: parking_lot::Mutex<Vec<String>>,
    rolled_back: parking_lot::Mutex<Vec<String>>,
    failing: parking_lot::Mutex<std::collections::HashSet<String>>,
    batches: parking_lot::Mutex<u64>,
}

impl RecordingMigrationExecutor {
    pub fn new() -> Self {
        Self {
            batches: parking_lot::Mutex::new(1),
            ..Self::default()
        }
    }

    pub fn with_batches(batches: u64) -> Self {
        Self {
            batches: parking_lot::Mutex::new(batches),
            ..Self::default()
        }
    }

    pub fn fail_on(&self, script: impl Into<String>) {
        self.failing.lock().insert(script.into());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.rolled_back.lock().clone()
    }
}

#[async_trait::async_trait]
impl MigrationExecutor for RecordingMigrationExecutor {
    async fn apply_batch(
        &self,
        migration: &Migration,
        cursor: u64,
    ) -> ControlPlaneResult<Option<u64>> {
        if self.failing.lock().contains(&migration.script) {
            return Err(ControlPlaneError::Store(format!(
                "simulated failure applying {}",
                migration.script
            )));
        }
        self.applied
            .lock()
            .push(format!("{}@{cursor}", migration.script));
        let next = cursor + 1;
        if next >= *self.batches.lock() {
            Ok(None)
        } else {
            Ok(Some(next))
        }
    }

    async fn rollback(&self, migration: &Migration) -> ControlPlaneResult<()> {
        self.rolled_back.lock().push(migration.rollback_script.clone());
        Ok(())
    }
}

pub struct MigrationRunner {
    executor: Arc<dyn MigrationExecutor>,
    migrations: DashMap<Uuid, Migration>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl MigrationRunner {
    pub fn new(
        executor: Arc<dyn MigrationExecutor>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executor,
            migrations: DashMap::new(),
            alerts,
            audit,
            clock,
        }
    }

    pub fn register(
        &self,
        group: impl Into<String>,
        phase: MigrationPhase,
        description: impl Into<String>,
        script: impl Into<String>,
        rollback_script: impl Into<String>,
    ) -> Migration {
        let migration = Migration {
            id: Uuid::new_v4(),
            group: group.into(),
            phase,
            description: description.into(),
            script: script.into(),
            rollback_script: rollback_script.into(),
            status: MigrationStatus::Pending,
            attempts: 0,
            batch_cursor: None,
            registered_at: self.clock.now(),
            finished_at: None,
        };
        self.audit.append(
            "system",
            "migration_registered",
            "deployment",
            serde_json::json!({
                "migration_id": migration.id,
                "group": migration.group,
                "phase": phase.as_str(),
            }),
        );
        self.migrations.insert(migration.id, migration.clone());
        migration
    }

    /// Run (or resume) a migration. Pending and failed migrations are
    /// runnable; completed and rolled-back ones are not.
    pub async fn run(&self, id: Uuid, actor: &str) -> ControlPlaneResult<Migration> {
        // Precondition checks run on a snapshot; iterating the map while
        // holding this migration's entry lock would deadlock.
        let snapshot = self
            .migrations
            .get(&id)
            .map(|m| m.clone())
            .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;

        match snapshot.status {
            MigrationStatus::Pending | MigrationStatus::Failed { .. } => {}
            ref other => {
                return Err(ControlPlaneError::InvalidTransition(format!(
                    "migration {id} is {other:?}, not runnable"
                )))
            }
        }
        if snapshot.phase == MigrationPhase::Contract {
            self.check_contract_preconditions(&snapshot)?;
        }

        let (migration, start_cursor) = {
            let mut entry = self
                .migrations
                .get_mut(&id)
                .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;
            entry.status = MigrationStatus::Running;
            entry.attempts += 1;
            let cursor = entry.batch_cursor.unwrap_or(0);
            (entry.clone(), cursor)
        };

        self.audit.append(
            actor,
            "migration_run_started",
            "deployment",
            serde_json::json!({
                "migration_id": id,
                "phase": migration.phase.as_str(),
                "attempt": migration.attempts,
                "resume_cursor": start_cursor,
            }),
        );

        let mut cursor = start_cursor;
        loop {
            let batch = tokio::time::timeout(
                BATCH_TIMEOUT,
                self.executor.apply_batch(&migration, cursor),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ControlPlaneError::Timeout(format!(
                    "migration batch at cursor {cursor}"
                )))
            });

            match batch {
                Ok(Some(next)) => {
                    // Persist the resume point so a crash mid-transform
                    // restarts from here, not from zero.
                    if let Some(mut entry) = self.migrations.get_mut(&id) {
                        entry.batch_cursor = Some(next);
                    }
                    cursor = next;
                }
                Ok(None) => {
                    let mut entry = self
                        .migrations
                        .get_mut(&id)
                        .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;
                    entry.status = MigrationStatus::Completed;
                    entry.batch_cursor = None;
                    entry.finished_at = Some(self.clock.now());
                    info!(migration = %id, phase = migration.phase.as_str(), "Migration completed");
                    self.audit.append(
                        actor,
                        "migration_completed",
                        "deployment",
                        serde_json::json!({ "migration_id": id }),
                    );
                    metrics::counter!("migrations.runs", "outcome" => "completed")
                        .increment(1);
                    return Ok(entry.clone());
                }
                Err(err) => {
                    let mut entry = self
                        .migrations
                        .get_mut(&id)
                        .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;
                    entry.status = MigrationStatus::Failed {
                        error: err.to_string(),
                    };
                    warn!(migration = %id, error = %err, "Migration failed");
                    self.alerts.emit(Alert::new(
                        AlertSeverity::Critical,
                        AlertCategory::Deployment,
                        format!("migration {} ({}) failed: {err}", migration.script, migration.phase.as_str()),
                    ));
                    self.audit.append(
                        actor,
                        "migration_failed",
                        "deployment",
                        serde_json::json!({ "migration_id": id, "error": err.to_string() }),
                    );
                    metrics::counter!("migrations.runs", "outcome" => "failed")
                        .increment(1);
                    return Ok(entry.clone());
                }
            }
        }
    }

    /// Run the paired rollback script for a completed or failed migration.
    pub async fn rollback(&self, id: Uuid, actor: &str) -> ControlPlaneResult<Migration> {
        let migration = {
            let entry = self
                .migrations
                .get(&id)
                .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;
            match entry.status {
                MigrationStatus::Completed | MigrationStatus::Failed { .. } => {}
                ref other => {
                    return Err(ControlPlaneError::InvalidTransition(format!(
                        "migration {id} is {other:?}, nothing to roll back"
                    )))
                }
            }
            entry.clone()
        };

        self.executor.rollback(&migration).await?;

        let mut entry = self
            .migrations
            .get_mut(&id)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("migration {id}")))?;
        entry.status = MigrationStatus::RolledBack;
        entry.batch_cursor = None;
        entry.finished_at = Some(self.clock.now());
        self.audit.append(
            actor,
            "migration_rolled_back",
            "deployment",
            serde_json::json!({ "migration_id": id, "script": migration.rollback_script }),
        );
        Ok(entry.clone())
    }

    /// Contract only runs once the group's expand and migrate phases have
    /// completed; destructive removal before that would strand live readers.
    fn check_contract_preconditions(&self, contract: &Migration) -> ControlPlaneResult<()> {
        for required in [MigrationPhase::Expand, MigrationPhase::Migrate] {
            let done = self.migrations.iter().any(|m| {
                m.group == contract.group
                    && m.phase == required
                    && m.status == MigrationStatus::Completed
            });
            if !done {
                return Err(ControlPlaneError::Validation(format!(
                    "contract phase of group {} requires a completed {} phase",
                    contract.group,
                    required.as_str()
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Migration> {
        self.migrations.get(&id).map(|m| m.clone())
    }

    pub fn list(&self) -> Vec<Migration> {
        let mut migrations: Vec<Migration> =
            self.migrations.iter().map(|m| m.clone()).collect();
        migrations.sort_by_key(|m| m.registered_at);
        migrations
    }
}
