//! Kill switches and the write gate.
//!
//! Read-only mode, maintenance mode, and emergency stop are independent
//! global toggles; per-tenant freezes live in the integrity crate's
//! `FrozenTenantSet`. Every write path consults `WriteGate::check_write`
//! synchronously before mutating data. Arming emergency stop or global
//! read-only requires the confirmation token.

use chrono::{DateTime, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::DeploymentConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity, TenantId};
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use ledgerpilot_integrity::freeze::FrozenTenantSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitch {
    ReadOnly,
    Maintenance,
    EmergencyStop,
}

impl KillSwitch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::Maintenance => "maintenance",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    /// Switches that halt writes platform-wide need an explicit
    /// confirmation token to arm.
    fn requires_confirmation(&self) -> bool {
        matches!(self, Self::ReadOnly | Self::EmergencyStop)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub switch: KillSwitch,
    pub armed_by: String,
    pub armed_at: DateTime<Utc>,
    pub reason: String,
}

/// Global kill-switch state.
pub struct KillSwitches {
    config: DeploymentConfig,
    active: Mutex<Vec<SwitchRecord>>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl KillSwitches {
    pub fn new(
        config: DeploymentConfig,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            active: Mutex::new(Vec::new()),
            alerts,
            audit,
            clock,
        }
    }

    /// Arm a switch. `confirmation` must match the configured token for
    /// read-only and emergency stop; it is ignored for maintenance mode.
    pub fn arm(
        &self,
        switch: KillSwitch,
        actor: &str,
        reason: impl Into<String>,
        confirmation: Option<&str>,
    ) -> ControlPlaneResult<SwitchRecord> {
        if switch.requires_confirmation() && confirmation != Some(self.config.confirmation_token.as_str())
        {
            warn!(switch = switch.as_str(), actor, "Kill switch rejected: bad confirmation token");
            return Err(ControlPlaneError::ConfirmationRequired(format!(
                "{} requires the confirmation token",
                switch.as_str()
            )));
        }

        let mut active = self.active.lock();
        if active.iter().any(|r| r.switch == switch) {
            return Err(ControlPlaneError::InvalidTransition(format!(
                "{} is already armed",
                switch.as_str()
            )));
        }

        let record = SwitchRecord {
            switch,
            armed_by: actor.to_string(),
            armed_at: self.clock.now(),
            reason: reason.into(),
        };
        active.push(record.clone());
        drop(active);

        info!(switch = switch.as_str(), actor, "Kill switch armed");
        self.audit.append(
            actor,
            "kill_switch_armed",
            "deployment",
            serde_json::json!({ "switch": switch.as_str(), "reason": record.reason }),
        );
        self.alerts.emit(Alert::new(
            if switch == KillSwitch::EmergencyStop {
                AlertSeverity::Page
            } else {
                AlertSeverity::Warning
            },
            AlertCategory::Deployment,
            format!("kill switch armed: {} ({})", switch.as_str(), record.reason),
        ));
        Ok(record)
    }

    pub fn disarm(&self, switch: KillSwitch, actor: &str) -> ControlPlaneResult<()> {
        let mut active = self.active.lock();
        let Some(index) = active.iter().position(|r| r.switch == switch) else {
            return Err(ControlPlaneError::NotFound(format!(
                "{} is not armed",
                switch.as_str()
            )));
        };
        active.remove(index);
        drop(active);

        info!(switch = switch.as_str(), actor, "Kill switch disarmed");
        self.audit.append(
            actor,
            "kill_switch_disarmed",
            "deployment",
            serde_json::json!({ "switch": switch.as_str() }),
        );
        Ok(())
    }

    pub fn is_armed(&self, switch: KillSwitch) -> bool {
        self.active.lock().iter().any(|r| r.switch == switch)
    }

    pub fn active(&self) -> Vec<SwitchRecord> {
        self.active.lock().clone()
    }
}

/// The synchronous write-path check shared by every mutating collaborator.
pub struct WriteGate {
    switches: Arc<KillSwitches>,
    frozen: Arc<FrozenTenantSet>,
}

impl WriteGate {
    pub fn new(switches: Arc<KillSwitches>, frozen: Arc<FrozenTenantSet>) -> Self {
        Self { switches, frozen }
    }

    /// Deny writes under any armed global switch, and per-tenant writes for
    /// frozen tenants. Must stay synchronous: it runs inline on hot write
    /// paths.
    pub fn check_write(&self, tenant: Option<TenantId>) -> ControlPlaneResult<()> {
        for switch in [
            KillSwitch::EmergencyStop,
            KillSwitch::ReadOnly,
            KillSwitch::Maintenance,
        ] {
            if self.switches.is_armed(switch) {
                return Err(ControlPlaneError::WriteDenied(format!(
                    "writes disabled: {} is armed",
                    switch.as_str()
                )));
            }
        }
        if let Some(tenant) = tenant {
            if self.frozen.is_frozen(tenant) {
                return Err(ControlPlaneError::WriteDenied(format!(
                    "tenant {tenant} is frozen"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::clock::ManualClock;
    use uuid::Uuid;

    fn switches() -> Arc<KillSwitches> {
        Arc::new(KillSwitches::new(
            DeploymentConfig::default(),
            capture_sink(),
            Arc::new(AuditLog::new()),
            Arc::new(ManualClock::starting_now()),
        ))
    }

    fn token() -> String {
        DeploymentConfig::default().confirmation_token
    }

    #[test]
    fn test_emergency_stop_requires_confirmation() {
        let s = switches();
        assert!(matches!(
            s.arm(KillSwitch::EmergencyStop, "ops", "incident", None),
            Err(ControlPlaneError::ConfirmationRequired(_))
        ));
        assert!(matches!(
            s.arm(KillSwitch::EmergencyStop, "ops", "incident", Some("WRONG")),
            Err(ControlPlaneError::ConfirmationRequired(_))
        ));
        assert!(s
            .arm(KillSwitch::EmergencyStop, "ops", "incident", Some(&token()))
            .is_ok());
        assert!(s.is_armed(KillSwitch::EmergencyStop));
    }

    #[test]
    fn test_maintenance_needs_no_confirmation() {
        let s = switches();
        assert!(s.arm(KillSwitch::Maintenance, "ops", "upgrade window", None).is_ok());
    }

    #[test]
    fn test_switches_are_independent() {
        let s = switches();
        s.arm(KillSwitch::Maintenance, "ops", "", None).unwrap();
        s.arm(KillSwitch::ReadOnly, "ops", "", Some(&token())).unwrap();
        assert!(s.is_armed(KillSwitch::Maintenance));
        assert!(s.is_armed(KillSwitch::ReadOnly));
        assert!(!s.is_armed(KillSwitch::EmergencyStop));

        s.disarm(KillSwitch::Maintenance, "ops").unwrap();
        assert!(!s.is_armed(KillSwitch::Maintenance));
        assert!(s.is_armed(KillSwitch::ReadOnly));
    }

    #[test]
    fn test_write_gate_blocks_under_switches_and_freezes() {
        let clock: Arc<dyn ledgerpilot_core::clock::Clock> =
            Arc::new(ManualClock::starting_now());
        let s = switches();
        let frozen = Arc::new(FrozenTenantSet::new(clock));
        let gate = WriteGate::new(s.clone(), frozen.clone());

        let tenant = Uuid::new_v4();
        assert!(gate.check_write(Some(tenant)).is_ok());
        assert!(gate.check_write(None).is_ok());

        frozen.freeze(tenant, "integrity failure", 3600);
        assert!(gate.check_write(Some(tenant)).is_err());
        assert!(gate.check_write(Some(Uuid::new_v4())).is_ok());

        s.arm(KillSwitch::ReadOnly, "ops", "", Some(&token())).unwrap();
        assert!(gate.check_write(None).is_err());
        assert!(gate.check_write(Some(Uuid::new_v4())).is_err());
    }
}
