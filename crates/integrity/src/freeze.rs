//! Frozen-tenant set — the single source of truth consulted by every write
//! path before mutating tenant data.
//!
//! Freezing is idempotent and the read-decide-write step for one tenant is
//! atomic (DashMap entry API, no await inside). Entries leave the set only
//! through an explicit unfreeze or TTL expiry, never silently. The TTL
//! exists so a crashed unfreeze path cannot leave a tenant frozen forever.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::types::TenantId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreezeRecord {
    pub tenant_id: TenantId,
    pub reason: String,
    pub since: DateTime<Utc>,
    pub ttl_secs: i64,
}

impl FreezeRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.since > Duration::seconds(self.ttl_secs)
    }
}

pub struct FrozenTenantSet {
    entries: DashMap<TenantId, FreezeRecord>,
    clock: Arc<dyn Clock>,
}

impl FrozenTenantSet {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Freeze a tenant. Returns `true` if a new freeze was recorded, `false`
    /// if the tenant was already frozen (idempotent no-op).
    pub fn freeze(&self, tenant_id: TenantId, reason: impl Into<String>, ttl_secs: i64) -> bool {
        let now = self.clock.now();
        let record = FreezeRecord {
            tenant_id,
            reason: reason.into(),
            since: now,
            ttl_secs,
        };

        match self.entries.entry(tenant_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expired(now) {
                    warn!(tenant = %tenant_id, "Expired freeze replaced with new freeze");
                    *occupied.get_mut() = record;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                info!(tenant = %tenant_id, reason = %record.reason, "Tenant frozen");
                vacant.insert(record);
                true
            }
        }
    }

    /// Explicitly unfreeze a tenant. Returns the removed record, if any.
    pub fn unfreeze(&self, tenant_id: TenantId) -> Option<FreezeRecord> {
        let removed = self.entries.remove(&tenant_id).map(|(_, record)| record);
        if removed.is_some() {
            info!(tenant = %tenant_id, "Tenant unfrozen");
        }
        removed
    }

    /// Whether the tenant is currently frozen. Expired entries are purged
    /// on read rather than lingering as silent freezes.
    pub fn is_frozen(&self, tenant_id: TenantId) -> bool {
        let now = self.clock.now();
        match self.entries.entry(tenant_id) {
            Entry::Occupied(occupied) => {
                if occupied.get().expired(now) {
                    occupied.remove();
                    false
                } else {
                    true
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// The freeze record for a tenant, if still active.
    pub fn record(&self, tenant_id: TenantId) -> Option<FreezeRecord> {
        if !self.is_frozen(tenant_id) {
            return None;
        }
        self.entries.get(&tenant_id).map(|r| r.value().clone())
    }

    /// All active freeze records.
    pub fn active(&self) -> Vec<FreezeRecord> {
        let now = self.clock.now();
        self.entries.retain(|_, record| !record.expired(now));
        let mut records: Vec<FreezeRecord> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.since);
        records
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerpilot_core::clock::ManualClock;
    use uuid::Uuid;

    fn set() -> (FrozenTenantSet, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (FrozenTenantSet::new(clock.clone()), clock)
    }

    #[test]
    fn test_freeze_is_idempotent() {
        let (set, _) = set();
        let tenant = Uuid::new_v4();

        assert!(set.freeze(tenant, "trial_balance", 3600));
        assert!(!set.freeze(tenant, "trial_balance", 3600));
        assert_eq!(set.len(), 1);
        assert!(set.is_frozen(tenant));
    }

    #[test]
    fn test_unfreeze_removes_record() {
        let (set, _) = set();
        let tenant = Uuid::new_v4();
        set.freeze(tenant, "pnl_consistency", 3600);

        let removed = set.unfreeze(tenant).unwrap();
        assert_eq!(removed.reason, "pnl_consistency");
        assert!(!set.is_frozen(tenant));
        assert!(set.unfreeze(tenant).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let (set, clock) = set();
        let tenant = Uuid::new_v4();
        set.freeze(tenant, "aging_reconciliation", 3600);

        clock.advance(Duration::seconds(3601));
        assert!(!set.is_frozen(tenant));
        assert!(set.active().is_empty());

        // A fresh freeze after expiry counts as new.
        assert!(set.freeze(tenant, "aging_reconciliation", 3600));
    }
}
