//! Shared domain types used across every control-plane crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tenants are identified by UUID everywhere in the platform.
pub type TenantId = Uuid;

/// The platform subsystems the control plane observes and acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Storage,
    Api,
    Cache,
    Queue,
    Workers,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Storage,
        Subsystem::Api,
        Subsystem::Cache,
        Subsystem::Queue,
        Subsystem::Workers,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Api => "api",
            Self::Cache => "cache",
            Self::Queue => "queue",
            Self::Workers => "workers",
        }
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Categorical health level. `Ord` follows severity so `max()` yields the
/// worst status across subsystems.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Severity of an emitted alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Notice,
    Warning,
    Critical,
    /// Wakes a human. Reserved for escalations and hard capacity limits.
    Page,
}

/// Which part of the control plane raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Health,
    Anomaly,
    Remediation,
    Integrity,
    Capacity,
    Deployment,
}

/// A single alert emitted by any component. Delivery transport is out of
/// scope; the control plane only records that an alert was emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub tenant_id: Option<TenantId>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, category: AlertCategory, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            category,
            message: message.into(),
            tenant_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_level_ordering() {
        assert!(HealthLevel::Critical > HealthLevel::Warning);
        assert!(HealthLevel::Warning > HealthLevel::Healthy);

        let worst = [HealthLevel::Healthy, HealthLevel::Critical, HealthLevel::Warning]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, HealthLevel::Critical);
    }

    #[test]
    fn test_alert_builder() {
        let tenant = Uuid::new_v4();
        let alert = Alert::new(
            AlertSeverity::Notice,
            AlertCategory::Capacity,
            "utilization crossed 80%",
        )
        .for_tenant(tenant);

        assert_eq!(alert.tenant_id, Some(tenant));
        assert_eq!(alert.severity, AlertSeverity::Notice);
    }
}
