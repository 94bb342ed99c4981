//! Feature flags with staged canary rollout.
//!
//! Enabling walks an ordered percentage ladder (1 -> 10 -> 50 -> 100 by
//! default); promotion to the next stage requires overall health to stay
//! non-critical for the dwell period. A health degradation during an active
//! rollout forces the percentage back to 0 exactly once and halts the flag
//! until an operator resumes it. Percentage mutation is single-writer per
//! flag via the map's entry lock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::DeploymentConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity, HealthLevel, TenantId};
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Who a flag's percentage bucketing applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagScope {
    Global,
    Tenant,
    User,
    Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FlagState {
    Disabled,
    RollingOut {
        stage_index: usize,
        stage_entered_at: DateTime<Utc>,
    },
    /// Forced to 0% after a health degradation; stays here until an
    /// operator resumes the rollout.
    Halted {
        halted_at: DateTime<Utc>,
        from_pct: u8,
    },
    Enabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub description: String,
    pub scope: FlagScope,
    pub rollout_pct: u8,
    /// Flags that touch ledger-mutating code paths must be marked safe
    /// before they can be evaluated on such a path.
    pub accounting_safe: bool,
    pub state: FlagState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct FeatureFlagManager {
    config: DeploymentConfig,
    flags: DashMap<String, FeatureFlag>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl FeatureFlagManager {
    pub fn new(
        config: DeploymentConfig,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            flags: DashMap::new(),
            alerts,
            audit,
            clock,
        }
    }

    pub fn create(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        scope: FlagScope,
        accounting_safe: bool,
    ) -> ControlPlaneResult<FeatureFlag> {
        let name = name.into();
        if self.flags.contains_key(&name) {
            return Err(ControlPlaneError::Validation(format!(
                "flag {name} already exists"
            )));
        }
        let now = self.clock.now();
        let flag = FeatureFlag {
            name: name.clone(),
            description: description.into(),
            scope,
            rollout_pct: 0,
            accounting_safe,
            state: FlagState::Disabled,
            created_at: now,
            updated_at: now,
        };
        self.audit.append(
            "system",
            "flag_created",
            "deployment",
            serde_json::json!({ "flag": name, "scope": scope, "accounting_safe": accounting_safe }),
        );
        self.flags.insert(name, flag.clone());
        Ok(flag)
    }

    /// Begin the canary at the first stage of the ladder.
    pub fn start_rollout(&self, name: &str) -> ControlPlaneResult<FeatureFlag> {
        let mut entry = self
            .flags
            .get_mut(name)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("flag {name}")))?;

        match entry.state {
            FlagState::Disabled => {}
            ref other => {
                return Err(ControlPlaneError::InvalidTransition(format!(
                    "flag {name} cannot start a rollout from {other:?}"
                )))
            }
        }

        let first_pct = *self.config.rollout_stages.first().unwrap_or(&100);
        entry.rollout_pct = first_pct;
        entry.state = FlagState::RollingOut {
            stage_index: 0,
            stage_entered_at: self.clock.now(),
        };
        entry.updated_at = self.clock.now();

        info!(flag = name, pct = first_pct, "Canary rollout started");
        self.audit.append(
            "system",
            "flag_rollout_started",
            "deployment",
            serde_json::json!({ "flag": name, "pct": first_pct }),
        );
        Ok(entry.clone())
    }

    /// Evaluate active rollouts against current overall health. Critical
    /// health halts every active rollout; otherwise flags whose dwell has
    /// elapsed are promoted one stage.
    pub fn tick(&self, overall: HealthLevel) {
        let now = self.clock.now();
        for mut entry in self.flags.iter_mut() {
            let FlagState::RollingOut {
                stage_index,
                stage_entered_at,
            } = entry.state
            else {
                continue;
            };

            if overall == HealthLevel::Critical {
                let from_pct = entry.rollout_pct;
                entry.rollout_pct = 0;
                entry.state = FlagState::Halted {
                    halted_at: now,
                    from_pct,
                };
                entry.updated_at = now;
                warn!(flag = %entry.name, from_pct, "Rollout halted by health degradation");
                self.alerts.emit(Alert::new(
                    AlertSeverity::Critical,
                    AlertCategory::Deployment,
                    format!(
                        "rollout of {} halted by health degradation (was at {from_pct}%)",
                        entry.name
                    ),
                ));
                self.audit.append(
                    "system",
                    "flag_rollout_halted",
                    "deployment",
                    serde_json::json!({ "flag": entry.name, "from_pct": from_pct }),
                );
                continue;
            }

            let dwell_elapsed = (now - stage_entered_at).num_seconds() >= self.config.dwell_secs;
            if !dwell_elapsed {
                continue;
            }

            let next_index = stage_index + 1;
            match self.config.rollout_stages.get(next_index) {
                Some(pct) => {
                    entry.rollout_pct = *pct;
                    entry.state = FlagState::RollingOut {
                        stage_index: next_index,
                        stage_entered_at: now,
                    };
                    entry.updated_at = now;
                    info!(flag = %entry.name, pct, "Canary promoted to next stage");
                    self.audit.append(
                        "system",
                        "flag_stage_promoted",
                        "deployment",
                        serde_json::json!({ "flag": entry.name, "pct": pct }),
                    );
                }
                None => {
                    entry.rollout_pct = 100;
                    entry.state = FlagState::Enabled;
                    entry.updated_at = now;
                    info!(flag = %entry.name, "Canary complete, flag fully enabled");
                    self.audit.append(
                        "system",
                        "flag_enabled",
                        "deployment",
                        serde_json::json!({ "flag": entry.name }),
                    );
                }
            }
        }
    }

    /// Resume a halted rollout from the bottom of the ladder.
    pub fn resume(&self, name: &str, actor: &str) -> ControlPlaneResult<FeatureFlag> {
        let mut entry = self
            .flags
            .get_mut(name)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("flag {name}")))?;

        if !matches!(entry.state, FlagState::Halted { .. }) {
            return Err(ControlPlaneError::InvalidTransition(format!(
                "flag {name} is not halted"
            )));
        }

        let first_pct = *self.config.rollout_stages.first().unwrap_or(&100);
        entry.rollout_pct = first_pct;
        entry.state = FlagState::RollingOut {
            stage_index: 0,
            stage_entered_at: self.clock.now(),
        };
        entry.updated_at = self.clock.now();
        self.audit.append(
            actor,
            "flag_rollout_resumed",
            "deployment",
            serde_json::json!({ "flag": name }),
        );
        Ok(entry.clone())
    }

    pub fn disable(&self, name: &str, actor: &str) -> ControlPlaneResult<FeatureFlag> {
        let mut entry = self
            .flags
            .get_mut(name)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("flag {name}")))?;
        entry.rollout_pct = 0;
        entry.state = FlagState::Disabled;
        entry.updated_at = self.clock.now();
        self.audit.append(
            actor,
            "flag_disabled",
            "deployment",
            serde_json::json!({ "flag": name }),
        );
        Ok(entry.clone())
    }

    /// Whether the flag is on for this tenant on this code path. A flag not
    /// marked accounting-safe always evaluates off on ledger-mutating paths,
    /// whatever its rollout percentage.
    pub fn is_enabled(&self, name: &str, tenant: TenantId, mutates_ledger: bool) -> bool {
        let Some(flag) = self.flags.get(name) else {
            return false;
        };
        if mutates_ledger && !flag.accounting_safe {
            return false;
        }
        match flag.state {
            FlagState::Disabled | FlagState::Halted { .. } => false,
            FlagState::Enabled => true,
            FlagState::RollingOut { .. } => bucket(&flag.name, tenant) < flag.rollout_pct,
        }
    }

    pub fn get(&self, name: &str) -> Option<FeatureFlag> {
        self.flags.get(name).map(|f| f.clone())
    }

    pub fn list(&self) -> Vec<FeatureFlag> {
        let mut flags: Vec<FeatureFlag> = self.flags.iter().map(|f| f.clone()).collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        flags
    }
}

/// Deterministic 0..100 bucket for a (flag, tenant) pair, so a tenant's
/// cohort is stable across evaluations and restarts.
fn bucket(flag_name: &str, tenant: TenantId) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(flag_name.as_bytes());
    hasher.update(tenant.as_bytes());
    let digest = hasher.finalize();
    (u16::from_be_bytes([digest[0], digest[1]]) % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::clock::ManualClock;
    use uuid::Uuid;

    struct Harness {
        manager: FeatureFlagManager,
        clock: Arc<ManualClock>,
        alerts: Arc<ledgerpilot_core::alerts::CaptureSink>,
        audit: Arc<AuditLog>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let alerts = capture_sink();
        let audit = Arc::new(AuditLog::new());
        let manager = FeatureFlagManager::new(
            DeploymentConfig::default(),
            alerts.clone(),
            audit.clone(),
            clock.clone(),
        );
        Harness {
            manager,
            clock,
            alerts,
            audit,
        }
    }

    fn dwell() -> Duration {
        Duration::seconds(DeploymentConfig::default().dwell_secs + 1)
    }

    #[test]
    fn test_canary_walks_the_ladder() {
        let h = harness();
        h.manager
            .create("new-invoice-ui", "redesigned invoice editor", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("new-invoice-ui").unwrap();
        assert_eq!(h.manager.get("new-invoice-ui").unwrap().rollout_pct, 1);

        for expected in [10, 50, 100] {
            h.clock.advance(dwell());
            h.manager.tick(HealthLevel::Healthy);
            assert_eq!(h.manager.get("new-invoice-ui").unwrap().rollout_pct, expected);
        }

        h.clock.advance(dwell());
        h.manager.tick(HealthLevel::Healthy);
        let flag = h.manager.get("new-invoice-ui").unwrap();
        assert_eq!(flag.state, FlagState::Enabled);
    }

    #[test]
    fn test_promotion_waits_for_dwell() {
        let h = harness();
        h.manager
            .create("fast-close", "", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("fast-close").unwrap();

        // No dwell elapsed: percentage must not move.
        h.manager.tick(HealthLevel::Healthy);
        h.manager.tick(HealthLevel::Warning);
        assert_eq!(h.manager.get("fast-close").unwrap().rollout_pct, 1);
    }

    #[test]
    fn test_degradation_forces_zero_exactly_once_and_halts() {
        let h = harness();
        h.manager
            .create("fast-close", "", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("fast-close").unwrap();
        h.clock.advance(dwell());
        h.manager.tick(HealthLevel::Healthy); // at 10%

        h.manager.tick(HealthLevel::Critical);
        let flag = h.manager.get("fast-close").unwrap();
        assert_eq!(flag.rollout_pct, 0);
        assert!(matches!(flag.state, FlagState::Halted { from_pct: 10, .. }));
        assert_eq!(h.alerts.count(), 1);

        // Further critical ticks do nothing more.
        h.manager.tick(HealthLevel::Critical);
        h.manager.tick(HealthLevel::Critical);
        assert_eq!(h.alerts.count(), 1);

        // Healthy ticks do not auto-resume.
        h.clock.advance(dwell());
        h.manager.tick(HealthLevel::Healthy);
        assert_eq!(h.manager.get("fast-close").unwrap().rollout_pct, 0);

        // Manual resume restarts from the bottom stage.
        h.manager.resume("fast-close", "ops").unwrap();
        assert_eq!(h.manager.get("fast-close").unwrap().rollout_pct, 1);
    }

    #[test]
    fn test_percentage_only_increases_while_rolling_out() {
        let h = harness();
        h.manager
            .create("fast-close", "", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("fast-close").unwrap();

        let mut last = 0u8;
        for _ in 0..6 {
            h.clock.advance(dwell());
            h.manager.tick(HealthLevel::Healthy);
            let pct = h.manager.get("fast-close").unwrap().rollout_pct;
            assert!(pct >= last);
            last = pct;
        }
    }

    #[test]
    fn test_unsafe_flag_never_enabled_on_ledger_path() {
        let h = harness();
        h.manager
            .create("raw-journal-edit", "", FlagScope::Tenant, false)
            .unwrap();
        h.manager.start_rollout("raw-journal-edit").unwrap();
        for _ in 0..5 {
            h.clock.advance(dwell());
            h.manager.tick(HealthLevel::Healthy);
        }
        assert_eq!(h.manager.get("raw-journal-edit").unwrap().state, FlagState::Enabled);

        let tenant = Uuid::new_v4();
        assert!(h.manager.is_enabled("raw-journal-edit", tenant, false));
        assert!(!h.manager.is_enabled("raw-journal-edit", tenant, true));
    }

    #[test]
    fn test_bucketing_is_deterministic() {
        let tenant = Uuid::new_v4();
        assert_eq!(bucket("some-flag", tenant), bucket("some-flag", tenant));
    }

    #[test]
    fn test_partial_rollout_enables_a_stable_cohort() {
        let h = harness();
        h.manager
            .create("fast-close", "", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("fast-close").unwrap();
        h.clock.advance(dwell());
        h.manager.tick(HealthLevel::Healthy);
        h.clock.advance(dwell());
        h.manager.tick(HealthLevel::Healthy); // 50%

        let tenants: Vec<TenantId> = (0..200).map(|_| Uuid::new_v4()).collect();
        let on: Vec<bool> = tenants
            .iter()
            .map(|t| h.manager.is_enabled("fast-close", *t, false))
            .collect();
        let enabled = on.iter().filter(|b| **b).count();
        // Roughly half; bounds are loose to keep the test deterministic-ish.
        assert!(enabled > 50 && enabled < 150, "enabled = {enabled}");

        // Same tenants evaluate the same way again.
        for (tenant, expected) in tenants.iter().zip(on.iter()) {
            assert_eq!(h.manager.is_enabled("fast-close", *tenant, false), *expected);
        }
    }

    #[test]
    fn test_flag_changes_are_audited() {
        let h = harness();
        h.manager
            .create("fast-close", "", FlagScope::Tenant, true)
            .unwrap();
        h.manager.start_rollout("fast-close").unwrap();
        h.manager.disable("fast-close", "ops").unwrap();

        let actions: Vec<String> = h.audit.entries().iter().map(|e| e.action.clone()).collect();
        assert_eq!(
            actions,
            vec!["flag_created", "flag_rollout_started", "flag_disabled"]
        );
    }
}
