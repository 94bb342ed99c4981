//! Capacity planning. Tracks active-tenant count against the current tier
//! ceiling, fires threshold actions exactly once per upward crossing, and
//! projects days-until-limit from the tenant-creation trend.

use chrono::{DateTime, Duration, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::CapacityConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity};
use ledgerpilot_remediation::executor::InfrastructureExecutor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Creation timestamps older than this are dropped from the trend window.
const TREND_RETENTION_DAYS: i64 = 60;

/// Workers added ahead of a tier switch.
const PREWARM_WORKER_STEP: i32 = 8;

/// A capacity band the platform operates within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityTier {
    pub name: &'static str,
    pub tenant_limit: u64,
}

/// Tier ladder, smallest first.
pub const TIERS: [CapacityTier; 4] = [
    CapacityTier { name: "starter", tenant_limit: 2_500 },
    CapacityTier { name: "growth", tenant_limit: 5_000 },
    CapacityTier { name: "scale", tenant_limit: 12_500 },
    CapacityTier { name: "enterprise", tenant_limit: 50_000 },
];

impl CapacityTier {
    /// Next rung on the ladder, if any.
    pub fn next(&self) -> Option<CapacityTier> {
        TIERS
            .iter()
            .position(|t| t.name == self.name)
            .and_then(|i| TIERS.get(i + 1))
            .copied()
    }

    pub fn by_name(name: &str) -> Option<CapacityTier> {
        TIERS.iter().find(|t| t.name == name).copied()
    }
}

/// Tenant-creation trend: trailing 30 days vs the prior 30-day window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GrowthProjection {
    pub trailing_30d: u64,
    pub prior_30d: u64,
    /// Projected days until the tier limit at the trailing rate. `None`
    /// when there has been no growth to extrapolate.
    pub days_until_limit: Option<u32>,
}

/// Dashboard-facing capacity snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityStatus {
    pub tier: CapacityTier,
    pub active_tenants: u64,
    pub utilization_pct: f64,
    pub upgrade_required: bool,
    pub prewarmed: bool,
    pub growth: GrowthProjection,
}

/// Latch state per threshold. A threshold fires on the upward crossing and
/// re-arms only after utilization drops back below it.
#[derive(Default)]
struct Latches {
    notice: bool,
    prewarm: bool,
    page: bool,
}

pub struct CapacityPlanner {
    config: CapacityConfig,
    executor: Arc<dyn InfrastructureExecutor>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    tier: Mutex<CapacityTier>,
    active_tenants: Mutex<u64>,
    creations: Mutex<Vec<DateTime<Utc>>>,
    latches: Mutex<Latches>,
    prewarmed: Mutex<bool>,
    upgrade_required: Mutex<bool>,
}

impl CapacityPlanner {
    pub fn new(
        config: CapacityConfig,
        tier: CapacityTier,
        executor: Arc<dyn InfrastructureExecutor>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            executor,
            alerts,
            audit,
            clock,
            tier: Mutex::new(tier),
            active_tenants: Mutex::new(0),
            creations: Mutex::new(Vec::new()),
            latches: Mutex::new(Latches::default()),
            prewarmed: Mutex::new(false),
            upgrade_required: Mutex::new(false),
        }
    }

    /// Update the active-tenant count ahead of the next tick.
    pub fn set_active_tenants(&self, count: u64) {
        *self.active_tenants.lock() = count;
    }

    /// Record a tenant creation for the growth trend.
    pub fn record_tenant_created(&self) {
        let now = self.clock.now();
        let cutoff = now - Duration::days(TREND_RETENTION_DAYS);
        let mut creations = self.creations.lock();
        creations.retain(|t| *t >= cutoff);
        creations.push(now);
    }

    pub fn current_tier(&self) -> CapacityTier {
        *self.tier.lock()
    }

    /// Switch to a new committed tier and reset the latch state so the
    /// thresholds re-evaluate against the new ceiling.
    pub fn commit_tier(&self, tier: CapacityTier) {
        *self.tier.lock() = tier;
        *self.latches.lock() = Latches::default();
        *self.prewarmed.lock() = false;
        *self.upgrade_required.lock() = false;
        info!(tier = tier.name, limit = tier.tenant_limit, "Committed new capacity tier");
    }

    pub fn upgrade_required(&self) -> bool {
        *self.upgrade_required.lock()
    }

    pub fn utilization_pct(&self) -> f64 {
        let tier = *self.tier.lock();
        let active = *self.active_tenants.lock();
        if tier.tenant_limit == 0 {
            return 0.0;
        }
        (active as f64 / tier.tenant_limit as f64) * 100.0
    }

    /// Evaluate thresholds against current utilization. Each threshold fires
    /// exactly once per upward crossing.
    pub async fn tick(&self) {
        let pct = self.utilization_pct();
        metrics::gauge!("capacity.utilization_pct").set(pct);

        let (fire_notice, fire_prewarm, fire_page) = {
            let mut latches = self.latches.lock();
            let fire_notice = crossed(pct, self.config.notice_pct, &mut latches.notice);
            let fire_prewarm = crossed(pct, self.config.prewarm_pct, &mut latches.prewarm);
            let fire_page = crossed(pct, self.config.page_pct, &mut latches.page);
            (fire_notice, fire_prewarm, fire_page)
        };

        if fire_notice {
            self.alerts.emit(Alert::new(
                AlertSeverity::Notice,
                AlertCategory::Capacity,
                format!("capacity utilization crossed {:.0}% ({pct:.1}%)", self.config.notice_pct),
            ));
        }

        if fire_prewarm {
            self.prewarm().await;
        }

        if fire_page {
            *self.upgrade_required.lock() = true;
            self.alerts.emit(Alert::new(
                AlertSeverity::Page,
                AlertCategory::Capacity,
                format!(
                    "capacity utilization crossed {:.0}% ({pct:.1}%); tier upgrade required",
                    self.config.page_pct
                ),
            ));
            self.audit.append(
                "system",
                "upgrade_required",
                "capacity",
                serde_json::json!({
                    "utilization_pct": pct,
                    "tier": self.current_tier().name,
                }),
            );
        }
    }

    /// Provision next-tier resources without switching to them.
    async fn prewarm(&self) {
        let tier = self.current_tier();
        let Some(next) = tier.next() else {
            warn!(tier = tier.name, "At the top tier, nothing to pre-warm");
            return;
        };

        info!(from = tier.name, to = next.name, "Pre-warming next-tier resources");
        let mut failures = 0u32;
        if let Err(err) = self.executor.provision_read_replica().await {
            warn!(error = %err, "Read-replica pre-warm failed");
            failures += 1;
        }
        if let Err(err) = self.executor.provision_connection_pool().await {
            warn!(error = %err, "Connection-pool pre-warm failed");
            failures += 1;
        }
        if let Err(err) = self.executor.provision_caching_layer().await {
            warn!(error = %err, "Cache-layer pre-warm failed");
            failures += 1;
        }
        if let Err(err) = self.executor.scale_workers(PREWARM_WORKER_STEP).await {
            warn!(error = %err, "Worker pre-warm failed");
            failures += 1;
        }

        *self.prewarmed.lock() = failures == 0;
        self.alerts.emit(Alert::new(
            if failures == 0 { AlertSeverity::Warning } else { AlertSeverity::Critical },
            AlertCategory::Capacity,
            format!(
                "capacity utilization crossed {:.0}%; pre-warmed {} resources ({failures} failures)",
                self.config.prewarm_pct, next.name
            ),
        ));
        self.audit.append(
            "system",
            "tier_prewarm",
            "capacity",
            serde_json::json!({
                "next_tier": next.name,
                "failures": failures,
            }),
        );
    }

    /// Compare the trailing 30-day creation count to the prior 30-day window
    /// and project days until the tier limit at the trailing rate.
    pub fn growth(&self) -> GrowthProjection {
        let now = self.clock.now();
        let trailing_start = now - Duration::days(30);
        let prior_start = now - Duration::days(60);

        let creations = self.creations.lock();
        let trailing = creations.iter().filter(|t| **t >= trailing_start).count() as u64;
        let prior = creations
            .iter()
            .filter(|t| **t >= prior_start && **t < trailing_start)
            .count() as u64;

        let tier = *self.tier.lock();
        let active = *self.active_tenants.lock();
        let headroom = tier.tenant_limit.saturating_sub(active);

        let days_until_limit = if trailing == 0 {
            None
        } else {
            let daily_rate = trailing as f64 / 30.0;
            Some((headroom as f64 / daily_rate).ceil() as u32)
        };

        GrowthProjection {
            trailing_30d: trailing,
            prior_30d: prior,
            days_until_limit,
        }
    }

    pub fn status(&self) -> CapacityStatus {
        // Read each lock into a local first: a guard temporary inside the
        // struct expression would live until the end of the expression and
        // deadlock against the re-locks in utilization_pct()/growth().
        let tier = self.current_tier();
        let active_tenants = *self.active_tenants.lock();
        let utilization_pct = self.utilization_pct();
        let upgrade_required = *self.upgrade_required.lock();
        let prewarmed = *self.prewarmed.lock();
        let growth = self.growth();
        CapacityStatus {
            tier,
            active_tenants,
            utilization_pct,
            upgrade_required,
            prewarmed,
            growth,
        }
    }
}

/// Edge trigger: fire when value reaches the threshold while un-latched;
/// re-arm once it drops back below.
fn crossed(value: f64, threshold: f64, latched: &mut bool) -> bool {
    if value >= threshold {
        if *latched {
            false
        } else {
            *latched = true;
            true
        }
    } else {
        *latched = false;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerpilot_core::alerts::{capture_sink, CaptureSink};
    use ledgerpilot_core::clock::ManualClock;
    use ledgerpilot_remediation::executor::{ExecutorCall, RecordingExecutor};

    struct Harness {
        planner: CapacityPlanner,
        alerts: Arc<CaptureSink>,
        executor: Arc<RecordingExecutor>,
        clock: Arc<ManualClock>,
    }

    fn harness(tier_name: &str) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let alerts = capture_sink();
        let executor = Arc::new(RecordingExecutor::new());
        let planner = CapacityPlanner::new(
            CapacityConfig::default(),
            CapacityTier::by_name(tier_name).unwrap(),
            executor.clone(),
            alerts.clone(),
            Arc::new(AuditLog::new()),
            clock.clone(),
        );
        Harness {
            planner,
            alerts,
            executor,
            clock,
        }
    }

    #[tokio::test]
    async fn test_notice_fires_exactly_once_per_crossing() {
        let h = harness("scale"); // limit 12,500
        h.planner.set_active_tenants(9_000); // 72%
        h.planner.tick().await;
        assert_eq!(h.alerts.count(), 0);

        h.planner.set_active_tenants(10_200); // 81.6%
        h.planner.tick().await;
        assert_eq!(h.alerts.count_severity(AlertSeverity::Notice), 1);

        // Stays above; no further notices.
        h.planner.tick().await;
        h.planner.set_active_tenants(10_500);
        h.planner.tick().await;
        assert_eq!(h.alerts.count_severity(AlertSeverity::Notice), 1);

        // Drops below and re-crosses: fires again.
        h.planner.set_active_tenants(9_000);
        h.planner.tick().await;
        h.planner.set_active_tenants(10_200);
        h.planner.tick().await;
        assert_eq!(h.alerts.count_severity(AlertSeverity::Notice), 2);
    }

    #[tokio::test]
    async fn test_prewarm_provisions_next_tier_once() {
        let h = harness("scale");
        h.planner.set_active_tenants(11_300); // 90.4%
        h.planner.tick().await;
        h.planner.tick().await;

        let calls = h.executor.calls();
        assert_eq!(
            calls,
            vec![
                ExecutorCall::ProvisionReadReplica,
                ExecutorCall::ProvisionConnectionPool,
                ExecutorCall::ProvisionCachingLayer,
                ExecutorCall::ScaleWorkers { delta: PREWARM_WORKER_STEP },
            ]
        );
        assert!(h.planner.status().prewarmed);
    }

    #[tokio::test]
    async fn test_page_threshold_marks_upgrade_required() {
        let h = harness("scale");
        h.planner.set_active_tenants(11_900); // 95.2%
        h.planner.tick().await;

        assert!(h.planner.upgrade_required());
        assert_eq!(h.alerts.count_severity(AlertSeverity::Page), 1);
    }

    #[tokio::test]
    async fn test_commit_tier_resets_latches() {
        let h = harness("growth"); // limit 5,000
        h.planner.set_active_tenants(4_800); // 96%
        h.planner.tick().await;
        assert!(h.planner.upgrade_required());

        h.planner.commit_tier(CapacityTier::by_name("scale").unwrap());
        assert!(!h.planner.upgrade_required());
        // 4,800 of 12,500 = 38.4%; nothing fires on the new tier.
        let before = h.alerts.count();
        h.planner.tick().await;
        assert_eq!(h.alerts.count(), before);
    }

    #[tokio::test]
    async fn test_growth_projection() {
        let h = harness("scale");
        h.planner.set_active_tenants(10_000);

        // 10 creations in the prior window, 60 in the trailing window.
        h.clock.set(Utc::now() - Duration::days(45));
        for _ in 0..10 {
            h.planner.record_tenant_created();
        }
        h.clock.set(Utc::now() - Duration::days(10));
        for _ in 0..60 {
            h.planner.record_tenant_created();
        }
        h.clock.set(Utc::now());

        let growth = h.planner.growth();
        assert_eq!(growth.trailing_30d, 60);
        assert_eq!(growth.prior_30d, 10);
        // Headroom 2,500 at 2 tenants/day.
        assert_eq!(growth.days_until_limit, Some(1_250));
    }

    #[tokio::test]
    async fn test_no_growth_means_no_projection() {
        let h = harness("starter");
        h.planner.set_active_tenants(100);
        assert!(h.planner.growth().days_until_limit.is_none());
    }

    #[test]
    fn test_tier_ladder() {
        let scale = CapacityTier::by_name("scale").unwrap();
        assert_eq!(scale.next().unwrap().name, "enterprise");
        assert!(CapacityTier::by_name("enterprise").unwrap().next().is_none());
    }
}
