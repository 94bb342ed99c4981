//! Financial integrity validation.
//!
//! Hourly checks cover posting invariants (trial balance, immutability,
//! orphans, idempotency keys); daily checks cover derived-report consistency
//! (P&L, balance sheet, aging, inventory). Any `failed` result runs the
//! freeze / auto-reconcile / re-validate / escalate protocol for the
//! affected tenant. Security-class failures skip reconciliation entirely.

use crate::freeze::FrozenTenantSet;
use crate::store::{LedgerStore, HIGH_VALUE_MINOR};
use chrono::{DateTime, Utc};
use ledgerpilot_core::alerts::AlertSink;
use ledgerpilot_core::audit::AuditLog;
use ledgerpilot_core::clock::Clock;
use ledgerpilot_core::config::IntegrityConfig;
use ledgerpilot_core::types::{Alert, AlertCategory, AlertSeverity, TenantId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Rounding tolerance in minor units for trial balance and P&L comparison.
const TOLERANCE_MINOR: i64 = 1;

/// Validation results kept in the bounded history.
const HISTORY_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    TrialBalance,
    LedgerImmutability,
    OrphanLines,
    DuplicateIdempotencyKeys,
    IdempotencyKeyPresence,
    PnlConsistency,
    BalanceSheetEquation,
    AgingReconciliation,
    InventoryValuation,
}

impl CheckKind {
    pub const HOURLY: [CheckKind; 5] = [
        CheckKind::TrialBalance,
        CheckKind::LedgerImmutability,
        CheckKind::OrphanLines,
        CheckKind::DuplicateIdempotencyKeys,
        CheckKind::IdempotencyKeyPresence,
    ];

    pub const DAILY: [CheckKind; 4] = [
        CheckKind::PnlConsistency,
        CheckKind::BalanceSheetEquation,
        CheckKind::AgingReconciliation,
        CheckKind::InventoryValuation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrialBalance => "trial_balance",
            Self::LedgerImmutability => "ledger_immutability",
            Self::OrphanLines => "orphan_lines",
            Self::DuplicateIdempotencyKeys => "duplicate_idempotency_keys",
            Self::IdempotencyKeyPresence => "idempotency_key_presence",
            Self::PnlConsistency => "pnl_consistency",
            Self::BalanceSheetEquation => "balance_sheet_equation",
            Self::AgingReconciliation => "aging_reconciliation",
            Self::InventoryValuation => "inventory_valuation",
        }
    }

    /// Whitelist of checks whose failures may be auto-reconciled by a
    /// deterministic regeneration. Everything else escalates straight to a
    /// human. Trial balance and the balance-sheet equation are deliberately
    /// excluded: a silent "fix" there would destroy evidence.
    pub fn reconcilable(&self) -> bool {
        matches!(
            self,
            Self::PnlConsistency
                | Self::AgingReconciliation
                | Self::InventoryValuation
                | Self::OrphanLines
        )
    }

    /// Security-class checks escalate immediately and are never reconciled.
    pub fn is_security_class(&self) -> bool {
        matches!(self, Self::LedgerImmutability)
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome category. Only `Failed` triggers the freeze protocol; `Warning`
/// is surfaced and logged but non-blocking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

/// Quantified delta for failures where an expected/actual pair exists.
/// Non-monetary checks (immutability, duplicates, key presence) carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialImbalance {
    pub tenant_id: TenantId,
    pub check: CheckKind,
    pub expected_minor: i64,
    pub actual_minor: i64,
    pub difference_minor: i64,
    pub affected_record_ids: Vec<Uuid>,
}

impl FinancialImbalance {
    fn new(
        tenant_id: TenantId,
        check: CheckKind,
        expected_minor: i64,
        actual_minor: i64,
        affected_record_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            tenant_id,
            check,
            expected_minor,
            actual_minor,
            difference_minor: actual_minor - expected_minor,
            affected_record_ids,
        }
    }
}

/// Per-tenant finding attached to a validation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantFinding {
    pub tenant_id: TenantId,
    pub detail: String,
    pub imbalance: Option<FinancialImbalance>,
}

/// One completed run of one check kind across all tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: Uuid,
    pub kind: CheckKind,
    pub run_at: DateTime<Utc>,
    pub status: CheckStatus,
    pub tenants_checked: usize,
    pub failures: Vec<TenantFinding>,
    pub warnings: Vec<TenantFinding>,
}

/// An item on the human-operator queue. Carries the full finding so the
/// operator never has to re-derive what went wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub kind: CheckKind,
    pub tenant_id: TenantId,
    pub detail: String,
    pub imbalance: Option<FinancialImbalance>,
    pub raised_at: DateTime<Utc>,
}

struct Finding {
    status: CheckStatus,
    detail: Option<String>,
    imbalance: Option<FinancialImbalance>,
}

impl Finding {
    fn passed() -> Self {
        Self {
            status: CheckStatus::Passed,
            detail: None,
            imbalance: None,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Failed,
            detail: Some(detail.into()),
            imbalance: None,
        }
    }

    fn failed_imbalanced(detail: impl Into<String>, imbalance: FinancialImbalance) -> Self {
        Self {
            status: CheckStatus::Failed,
            detail: Some(detail.into()),
            imbalance: Some(imbalance),
        }
    }

    fn warning(detail: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warning,
            detail: Some(detail.into()),
            imbalance: None,
        }
    }
}

pub struct FinancialIntegrityValidator {
    config: IntegrityConfig,
    store: Arc<dyn LedgerStore>,
    frozen: Arc<FrozenTenantSet>,
    alerts: Arc<dyn AlertSink>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    history: Mutex<VecDeque<ValidationResult>>,
    escalations: Mutex<VecDeque<Escalation>>,
}

impl FinancialIntegrityValidator {
    pub fn new(
        config: IntegrityConfig,
        store: Arc<dyn LedgerStore>,
        frozen: Arc<FrozenTenantSet>,
        alerts: Arc<dyn AlertSink>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            frozen,
            alerts,
            audit,
            clock,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            escalations: Mutex::new(VecDeque::new()),
        }
    }

    /// Run the five hourly posting-invariant checks.
    pub async fn run_hourly(&self) -> Vec<ValidationResult> {
        self.run_checks(&CheckKind::HOURLY).await
    }

    /// Run the four daily report-consistency checks.
    pub async fn run_daily(&self) -> Vec<ValidationResult> {
        self.run_checks(&CheckKind::DAILY).await
    }

    async fn run_checks(&self, kinds: &[CheckKind]) -> Vec<ValidationResult> {
        let mut results = Vec::with_capacity(kinds.len());
        for kind in kinds {
            results.push(self.run_check(*kind).await);
        }
        results
    }

    /// Run one check kind across every tenant, then apply the failure
    /// protocol to each failing tenant.
    pub async fn run_check(&self, kind: CheckKind) -> ValidationResult {
        let tenants = match self.store.tenant_ids().await {
            Ok(tenants) => tenants,
            Err(err) => {
                warn!(check = %kind, error = %err, "Tenant enumeration failed; check degraded");
                let result = ValidationResult {
                    id: Uuid::new_v4(),
                    kind,
                    run_at: self.clock.now(),
                    status: CheckStatus::Warning,
                    tenants_checked: 0,
                    failures: Vec::new(),
                    warnings: Vec::new(),
                };
                self.record(result.clone());
                return result;
            }
        };

        let timeout = Duration::from_millis(self.config.check_timeout_ms);
        let mut failures = Vec::new();
        let mut warnings = Vec::new();

        for tenant in &tenants {
            let finding =
                match tokio::time::timeout(timeout, self.check_tenant(kind, *tenant)).await {
                    Ok(Ok(finding)) => finding,
                    Ok(Err(err)) => {
                        // Transient store failure degrades this tenant's
                        // check; it never blocks the rest of the cycle.
                        warn!(check = %kind, tenant = %tenant, error = %err, "Check degraded");
                        Finding::warning(format!("check degraded: {err}"))
                    }
                    Err(_) => {
                        warn!(check = %kind, tenant = %tenant, "Check timed out");
                        Finding::warning(format!(
                            "check timed out after {}ms",
                            self.config.check_timeout_ms
                        ))
                    }
                };

            match finding.status {
                CheckStatus::Failed => failures.push(TenantFinding {
                    tenant_id: *tenant,
                    detail: finding.detail.unwrap_or_default(),
                    imbalance: finding.imbalance,
                }),
                CheckStatus::Warning => warnings.push(TenantFinding {
                    tenant_id: *tenant,
                    detail: finding.detail.unwrap_or_default(),
                    imbalance: finding.imbalance,
                }),
                CheckStatus::Passed => {}
            }
        }

        let status = if !failures.is_empty() {
            CheckStatus::Failed
        } else if !warnings.is_empty() {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        };

        let result = ValidationResult {
            id: Uuid::new_v4(),
            kind,
            run_at: self.clock.now(),
            status,
            tenants_checked: tenants.len(),
            failures: failures.clone(),
            warnings,
        };

        metrics::counter!(
            "integrity.checks",
            "kind" => kind.as_str(),
            "status" => match status {
                CheckStatus::Passed => "passed",
                CheckStatus::Warning => "warning",
                CheckStatus::Failed => "failed",
            }
        )
        .increment(1);

        for failure in &failures {
            self.handle_failure(kind, failure).await;
        }

        metrics::gauge!("integrity.frozen_tenants").set(self.frozen.len() as f64);
        self.record(result.clone());
        result
    }

    /// FREEZE → AUTO-RECONCILE (whitelisted only) → re-validate → unfreeze
    /// on pass, escalate otherwise. The freeze itself is idempotent.
    async fn handle_failure(&self, kind: CheckKind, failure: &TenantFinding) {
        let tenant = failure.tenant_id;
        let newly_frozen = self.frozen.freeze(
            tenant,
            format!("{} check failed: {}", kind, failure.detail),
            self.config.freeze_ttl_secs,
        );

        self.audit.append(
            "system",
            "tenant_frozen",
            "integrity",
            serde_json::json!({
                "tenant_id": tenant,
                "check": kind.as_str(),
                "detail": failure.detail,
                "imbalance": failure.imbalance,
                "newly_frozen": newly_frozen,
            }),
        );
        self.alerts.emit(
            Alert::new(
                AlertSeverity::Critical,
                AlertCategory::Integrity,
                format!("{} check failed: {}", kind, failure.detail),
            )
            .for_tenant(tenant),
        );

        if kind.is_security_class() {
            self.escalate(kind, failure, "security-class failure, no auto-reconciliation")
                .await;
            return;
        }

        if !kind.reconcilable() {
            self.escalate(kind, failure, "check is not auto-reconcilable")
                .await;
            return;
        }

        let timeout = Duration::from_millis(self.config.check_timeout_ms);
        let reconciled = match tokio::time::timeout(timeout, self.reconcile(kind, tenant)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(check = %kind, tenant = %tenant, error = %err, "Reconciliation failed");
                false
            }
            Err(_) => {
                warn!(check = %kind, tenant = %tenant, "Reconciliation timed out");
                false
            }
        };

        self.audit.append(
            "system",
            "auto_reconcile_attempted",
            "integrity",
            serde_json::json!({
                "tenant_id": tenant,
                "check": kind.as_str(),
                "succeeded": reconciled,
            }),
        );

        if !reconciled {
            self.escalate(kind, failure, "reconciliation routine failed")
                .await;
            return;
        }

        // Re-run the originating check; only a clean pass unfreezes.
        let revalidated =
            match tokio::time::timeout(timeout, self.check_tenant(kind, tenant)).await {
                Ok(Ok(finding)) => finding.status == CheckStatus::Passed,
                Ok(Err(_)) | Err(_) => false,
            };

        if revalidated {
            self.frozen.unfreeze(tenant);
            self.audit.append(
                "system",
                "tenant_unfrozen",
                "integrity",
                serde_json::json!({
                    "tenant_id": tenant,
                    "check": kind.as_str(),
                    "via": "auto_reconcile",
                }),
            );
            self.alerts.emit(
                Alert::new(
                    AlertSeverity::Notice,
                    AlertCategory::Integrity,
                    format!("{} auto-reconciled and re-validated, tenant unfrozen", kind),
                )
                .for_tenant(tenant),
            );
            info!(check = %kind, tenant = %tenant, "Auto-reconciliation succeeded");
        } else {
            self.escalate(kind, failure, "check still failing after reconciliation")
                .await;
        }
    }

    async fn escalate(&self, kind: CheckKind, failure: &TenantFinding, reason: &str) {
        let escalation = Escalation {
            id: Uuid::new_v4(),
            kind,
            tenant_id: failure.tenant_id,
            detail: failure.detail.clone(),
            imbalance: failure.imbalance.clone(),
            raised_at: self.clock.now(),
        };

        self.audit.append(
            "system",
            "escalated_to_operator",
            "integrity",
            serde_json::json!({
                "tenant_id": failure.tenant_id,
                "check": kind.as_str(),
                "detail": failure.detail,
                "imbalance": failure.imbalance,
                "reason": reason,
            }),
        );
        self.alerts.emit(
            Alert::new(
                AlertSeverity::Page,
                AlertCategory::Integrity,
                format!("{} failure escalated: {} ({reason})", kind, failure.detail),
            )
            .for_tenant(failure.tenant_id),
        );
        metrics::counter!("integrity.escalations", "kind" => kind.as_str())
            .increment(1);

        self.escalations.lock().push_back(escalation);
    }

    async fn reconcile(
        &self,
        kind: CheckKind,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<()> {
        match kind {
            CheckKind::PnlConsistency => self.store.regenerate_pnl(tenant).await,
            CheckKind::AgingReconciliation => self.store.regenerate_aging(tenant).await,
            CheckKind::InventoryValuation => self.store.recalculate_inventory(tenant).await,
            CheckKind::OrphanLines => {
                let removed = self.store.remove_orphan_lines(tenant).await?;
                info!(tenant = %tenant, removed, "Removed orphan ledger lines");
                Ok(())
            }
            // Guarded by `reconcilable()` at the call site.
            _ => Err(ledgerpilot_core::ControlPlaneError::Validation(format!(
                "{kind} is not auto-reconcilable"
            ))),
        }
    }

    async fn check_tenant(
        &self,
        kind: CheckKind,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        match kind {
            CheckKind::TrialBalance => self.check_trial_balance(tenant).await,
            CheckKind::LedgerImmutability => self.check_immutability(tenant).await,
            CheckKind::OrphanLines => self.check_orphans(tenant).await,
            CheckKind::DuplicateIdempotencyKeys => self.check_duplicates(tenant).await,
            CheckKind::IdempotencyKeyPresence => self.check_key_presence(tenant).await,
            CheckKind::PnlConsistency => self.check_pnl(tenant).await,
            CheckKind::BalanceSheetEquation => self.check_balance_sheet(tenant).await,
            CheckKind::AgingReconciliation => self.check_aging(tenant).await,
            CheckKind::InventoryValuation => self.check_inventory(tenant).await,
        }
    }

    async fn check_trial_balance(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let lines = self.store.lines(tenant).await?;
        let debits: i64 = lines.iter().map(|l| l.debit_minor).sum();
        let credits: i64 = lines.iter().map(|l| l.credit_minor).sum();
        let diff = debits - credits;
        if diff.abs() <= TOLERANCE_MINOR {
            Ok(Finding::passed())
        } else {
            // Pin the imbalance to the entries whose own lines do not net.
            let mut per_entry: HashMap<Uuid, i64> = HashMap::new();
            for line in &lines {
                *per_entry.entry(line.entry_id).or_insert(0) +=
                    line.debit_minor - line.credit_minor;
            }
            let affected: Vec<Uuid> = per_entry
                .into_iter()
                .filter(|(_, net)| net.abs() > TOLERANCE_MINOR)
                .map(|(id, _)| id)
                .collect();
            Ok(Finding::failed_imbalanced(
                format!("debits {debits} != credits {credits} (diff {diff})"),
                FinancialImbalance::new(
                    tenant,
                    CheckKind::TrialBalance,
                    credits,
                    debits,
                    affected,
                ),
            ))
        }
    }

    async fn check_immutability(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let entries = self.store.entries(tenant).await?;
        let violations: Vec<Uuid> = entries
            .iter()
            .filter(|e| e.modified_at > e.posted_at)
            .map(|e| e.id)
            .collect();
        if violations.is_empty() {
            Ok(Finding::passed())
        } else {
            Ok(Finding::failed(format!(
                "{} posted entries modified after posting: {:?}",
                violations.len(),
                violations
            )))
        }
    }

    async fn check_orphans(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let entries = self.store.entries(tenant).await?;
        let entry_ids: std::collections::HashSet<Uuid> = entries.iter().map(|e| e.id).collect();
        let orphans = self
            .store
            .lines(tenant)
            .await?
            .iter()
            .filter(|l| !entry_ids.contains(&l.entry_id))
            .count();
        if orphans == 0 {
            Ok(Finding::passed())
        } else {
            Ok(Finding::failed(format!(
                "{orphans} lines reference a non-existent parent entry"
            )))
        }
    }

    async fn check_duplicates(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let entries = self.store.entries(tenant).await?;
        let mut seen: HashMap<&str, u32> = HashMap::new();
        for entry in &entries {
            if let Some(key) = entry.idempotency_key.as_deref() {
                *seen.entry(key).or_insert(0) += 1;
            }
        }
        let duplicates: Vec<&str> = seen
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(key, _)| *key)
            .collect();
        if duplicates.is_empty() {
            Ok(Finding::passed())
        } else {
            Ok(Finding::failed(format!(
                "idempotency keys shared by multiple entries: {duplicates:?}"
            )))
        }
    }

    async fn check_key_presence(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let entries = self.store.entries(tenant).await?;
        let mut high_value_missing = 0usize;
        let mut low_value_missing = 0usize;
        for entry in &entries {
            if entry.entry_type.mutation_sensitive() && entry.idempotency_key.is_none() {
                if entry.amount_minor >= HIGH_VALUE_MINOR {
                    high_value_missing += 1;
                } else {
                    low_value_missing += 1;
                }
            }
        }
        if high_value_missing > 0 {
            Ok(Finding::failed(format!(
                "{high_value_missing} high-value mutation-sensitive entries lack an idempotency key"
            )))
        } else if low_value_missing > 0 {
            Ok(Finding::warning(format!(
                "{low_value_missing} mutation-sensitive entries below the high-value threshold lack a key"
            )))
        } else {
            Ok(Finding::passed())
        }
    }

    async fn check_pnl(&self, tenant: TenantId) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let Some(stored) = self.store.stored_pnl(tenant).await? else {
            return Ok(Finding::passed());
        };
        let entries = self.store.entries(tenant).await?;
        let revenue: i64 = entries
            .iter()
            .filter(|e| e.entry_type.is_revenue())
            .map(|e| e.amount_minor)
            .sum();
        let expenses: i64 = entries
            .iter()
            .filter(|e| e.entry_type.is_expense())
            .map(|e| e.amount_minor)
            .sum();
        let recomputed = revenue - expenses;
        if (recomputed - stored.net_minor).abs() <= TOLERANCE_MINOR {
            Ok(Finding::passed())
        } else {
            Ok(Finding::failed_imbalanced(
                format!("recomputed net {recomputed} != stored {}", stored.net_minor),
                FinancialImbalance::new(
                    tenant,
                    CheckKind::PnlConsistency,
                    recomputed,
                    stored.net_minor,
                    Vec::new(),
                ),
            ))
        }
    }

    async fn check_balance_sheet(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let Some(sheet) = self.store.balance_sheet(tenant).await? else {
            return Ok(Finding::passed());
        };
        if sheet.assets_minor == sheet.liabilities_minor + sheet.equity_minor {
            Ok(Finding::passed())
        } else {
            Ok(Finding::failed_imbalanced(
                format!(
                    "assets {} != liabilities {} + equity {}",
                    sheet.assets_minor, sheet.liabilities_minor, sheet.equity_minor
                ),
                FinancialImbalance::new(
                    tenant,
                    CheckKind::BalanceSheetEquation,
                    sheet.liabilities_minor + sheet.equity_minor,
                    sheet.assets_minor,
                    Vec::new(),
                ),
            ))
        }
    }

    async fn check_aging(&self, tenant: TenantId) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let reports = self.store.aging_reports(tenant).await?;
        for report in &reports {
            let bucket_total: i64 = report.bucket_totals_minor.iter().map(|(_, v)| v).sum();
            if bucket_total != report.source_balance_minor {
                return Ok(Finding::failed_imbalanced(
                    format!(
                        "{:?} aging buckets sum to {bucket_total}, source balance is {}",
                        report.side, report.source_balance_minor
                    ),
                    FinancialImbalance::new(
                        tenant,
                        CheckKind::AgingReconciliation,
                        report.source_balance_minor,
                        bucket_total,
                        Vec::new(),
                    ),
                ));
            }
        }
        Ok(Finding::passed())
    }

    async fn check_inventory(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<Finding> {
        let items = self.store.inventory(tenant).await?;
        for item in &items {
            if item.quantity < 0 || item.unit_cost_minor < 0 || item.total_value_minor < 0 {
                return Ok(Finding::failed(format!(
                    "sku {} has a negative quantity, cost, or value",
                    item.sku
                )));
            }
            if item.total_value_minor != item.quantity * item.unit_cost_minor {
                return Ok(Finding::failed_imbalanced(
                    format!(
                        "sku {} total value {} != quantity {} x unit cost {}",
                        item.sku, item.total_value_minor, item.quantity, item.unit_cost_minor
                    ),
                    FinancialImbalance::new(
                        tenant,
                        CheckKind::InventoryValuation,
                        item.quantity * item.unit_cost_minor,
                        item.total_value_minor,
                        vec![item.id],
                    ),
                ));
            }
        }
        Ok(Finding::passed())
    }

    /// Re-run every check for one tenant without triggering the failure
    /// protocol. Used by manual unfreeze, which requires a clean pass.
    pub async fn revalidate_tenant(
        &self,
        tenant: TenantId,
    ) -> ledgerpilot_core::ControlPlaneResult<bool> {
        let kinds = CheckKind::HOURLY.iter().chain(CheckKind::DAILY.iter());
        for kind in kinds {
            let finding = self.check_tenant(*kind, tenant).await?;
            if finding.status == CheckStatus::Failed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn record(&self, result: ValidationResult) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(result);
    }

    /// Most recent validation results, newest first.
    pub fn recent_results(&self, limit: usize) -> Vec<ValidationResult> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Pending operator-queue items, oldest first.
    pub fn escalations(&self) -> Vec<Escalation> {
        self.escalations.lock().iter().cloned().collect()
    }

    /// Acknowledge and remove an escalation from the queue.
    pub fn resolve_escalation(&self, id: Uuid) -> Option<Escalation> {
        let mut queue = self.escalations.lock();
        let index = queue.iter().position(|e| e.id == id)?;
        queue.remove(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        AgingReport, AgingSide, EntryType, InMemoryLedger, InventoryItem, PnlStatement,
    };
    use ledgerpilot_core::alerts::capture_sink;
    use ledgerpilot_core::clock::ManualClock;

    struct Harness {
        validator: FinancialIntegrityValidator,
        ledger: Arc<InMemoryLedger>,
        frozen: Arc<FrozenTenantSet>,
        alerts: Arc<ledgerpilot_core::alerts::CaptureSink>,
        audit: Arc<AuditLog>,
    }

    fn harness() -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let ledger = Arc::new(InMemoryLedger::new());
        let frozen = Arc::new(FrozenTenantSet::new(clock.clone()));
        let alerts = capture_sink();
        let audit = Arc::new(AuditLog::new());
        let validator = FinancialIntegrityValidator::new(
            IntegrityConfig::default(),
            ledger.clone(),
            frozen.clone(),
            alerts.clone(),
            audit.clone(),
            clock,
        );
        Harness {
            validator,
            ledger,
            frozen,
            alerts,
            audit,
        }
    }

    #[tokio::test]
    async fn test_balanced_ledger_passes_trial_balance() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 50_000, Some("inv-1".into()));
        h.ledger.post_entry(tenant, EntryType::Payment, 25_000, Some("pay-1".into()));

        let result = h.validator.run_check(CheckKind::TrialBalance).await;
        assert_eq!(result.status, CheckStatus::Passed);
        assert!(!h.frozen.is_frozen(tenant));
    }

    #[tokio::test]
    async fn test_unbalanced_entry_freezes_tenant_without_silent_correction() {
        let h = harness();
        let tenant = Uuid::new_v4();
        // Deliberately unbalanced: debit 1000, credit 100.
        h.ledger
            .post_entry_with_lines(tenant, EntryType::Payment, 1000, 100, Some("pay-1".into()));

        let result = h.validator.run_check(CheckKind::TrialBalance).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(h.frozen.is_frozen(tenant));

        // Not on the whitelist, so it must escalate and never reconcile.
        let escalations = h.validator.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].kind, CheckKind::TrialBalance);

        // The imbalance must still be present afterwards.
        let rerun = h.validator.run_check(CheckKind::TrialBalance).await;
        assert_eq!(rerun.status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_trial_balance_quantifies_the_imbalance() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let entry_id = h
            .ledger
            .post_entry_with_lines(tenant, EntryType::Payment, 1000, 100, Some("pay-1".into()));

        let result = h.validator.run_check(CheckKind::TrialBalance).await;
        assert_eq!(result.status, CheckStatus::Failed);

        let imbalance = result.failures[0].imbalance.as_ref().unwrap();
        assert_eq!(imbalance.tenant_id, tenant);
        assert_eq!(imbalance.check, CheckKind::TrialBalance);
        assert_eq!(imbalance.expected_minor, 100);
        assert_eq!(imbalance.actual_minor, 1000);
        assert_eq!(imbalance.difference_minor, 900);
        assert_eq!(imbalance.affected_record_ids, vec![entry_id]);

        // The operator queue carries the same quantified delta.
        let escalations = h.validator.escalations();
        let escalated = escalations[0].imbalance.as_ref().unwrap();
        assert_eq!(escalated.difference_minor, 900);
        assert_eq!(escalated.affected_record_ids, vec![entry_id]);
    }

    #[tokio::test]
    async fn test_balance_sheet_failure_carries_expected_and_actual() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 100, Some("inv-1".into()));
        h.ledger.set_balance_sheet(crate::store::BalanceSheet {
            tenant_id: tenant,
            assets_minor: 1000,
            liabilities_minor: 400,
            equity_minor: 500,
        });

        let result = h.validator.run_check(CheckKind::BalanceSheetEquation).await;
        let imbalance = result.failures[0].imbalance.as_ref().unwrap();
        assert_eq!(imbalance.expected_minor, 900);
        assert_eq!(imbalance.actual_minor, 1000);
        assert_eq!(imbalance.difference_minor, 100);
    }

    #[tokio::test]
    async fn test_non_monetary_failure_carries_no_imbalance() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let entry_id = h
            .ledger
            .post_entry(tenant, EntryType::Invoice, 5000, Some("inv-1".into()));
        assert!(h.ledger.touch_entry(entry_id));

        let result = h.validator.run_check(CheckKind::LedgerImmutability).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(result.failures[0].imbalance.is_none());
    }

    #[tokio::test]
    async fn test_one_unit_imbalance_is_within_tolerance() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger
            .post_entry_with_lines(tenant, EntryType::Invoice, 1000, 999, Some("inv-1".into()));

        let result = h.validator.run_check(CheckKind::TrialBalance).await;
        assert_eq!(result.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn test_immutability_violation_escalates_immediately() {
        let h = harness();
        let tenant = Uuid::new_v4();
        let entry_id = h
            .ledger
            .post_entry(tenant, EntryType::Invoice, 5000, Some("inv-1".into()));
        assert!(h.ledger.touch_entry(entry_id));

        let result = h.validator.run_check(CheckKind::LedgerImmutability).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(h.frozen.is_frozen(tenant));

        let escalations = h.validator.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(h.alerts.count_severity(AlertSeverity::Page), 1);

        // No reconciliation attempt may appear in the audit trail.
        let reconciles = h
            .audit
            .entries()
            .iter()
            .filter(|e| e.action == "auto_reconcile_attempted")
            .count();
        assert_eq!(reconciles, 0);
    }

    #[tokio::test]
    async fn test_pnl_drift_is_reconciled_and_tenant_unfrozen() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 10_000, Some("inv-1".into()));
        h.ledger.post_entry(tenant, EntryType::Bill, 4_000, None);
        h.ledger.set_pnl(PnlStatement {
            tenant_id: tenant,
            revenue_minor: 10_000,
            expense_minor: 4_000,
            net_minor: 5_000, // drifted from the true 6_000
            generated_at: Utc::now(),
        });

        let result = h.validator.run_check(CheckKind::PnlConsistency).await;
        assert_eq!(result.status, CheckStatus::Failed);

        // Reconciled, re-validated, unfrozen; nothing escalated.
        assert!(!h.frozen.is_frozen(tenant));
        assert!(h.validator.escalations().is_empty());

        let actions: Vec<String> = h.audit.entries().iter().map(|e| e.action.clone()).collect();
        assert!(actions.contains(&"tenant_frozen".to_string()));
        assert!(actions.contains(&"auto_reconcile_attempted".to_string()));
        assert!(actions.contains(&"tenant_unfrozen".to_string()));
    }

    #[tokio::test]
    async fn test_orphan_lines_are_cleaned_and_tenant_unfrozen() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Payment, 100, Some("pay-1".into()));
        h.ledger.insert_orphan_line(tenant, 250);

        let result = h.validator.run_check(CheckKind::OrphanLines).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(!h.frozen.is_frozen(tenant));
        assert!(h.validator.escalations().is_empty());
    }

    #[tokio::test]
    async fn test_balance_sheet_failure_is_never_reconciled() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 100, Some("inv-1".into()));
        h.ledger.set_balance_sheet(crate::store::BalanceSheet {
            tenant_id: tenant,
            assets_minor: 1000,
            liabilities_minor: 400,
            equity_minor: 500, // off by 100
        });

        let result = h.validator.run_check(CheckKind::BalanceSheetEquation).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(h.frozen.is_frozen(tenant));
        assert_eq!(h.validator.escalations().len(), 1);

        let reconciles = h
            .audit
            .entries()
            .iter()
            .filter(|e| e.action == "auto_reconcile_attempted")
            .count();
        assert_eq!(reconciles, 0);
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_keys_fail() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Payment, 100, Some("dup".into()));
        h.ledger.post_entry(tenant, EntryType::Payment, 100, Some("dup".into()));

        let result = h.validator.run_check(CheckKind::DuplicateIdempotencyKeys).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(h.frozen.is_frozen(tenant));
    }

    #[tokio::test]
    async fn test_high_value_entry_without_key_fails() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger
            .post_entry(tenant, EntryType::Payroll, HIGH_VALUE_MINOR, None);

        let result = h.validator.run_check(CheckKind::IdempotencyKeyPresence).await;
        assert_eq!(result.status, CheckStatus::Failed);
    }

    #[tokio::test]
    async fn test_low_value_missing_key_is_warning_only() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Payment, 500, None);

        let result = h.validator.run_check(CheckKind::IdempotencyKeyPresence).await;
        assert_eq!(result.status, CheckStatus::Warning);
        assert!(!h.frozen.is_frozen(tenant));
        assert!(h.validator.escalations().is_empty());
    }

    #[tokio::test]
    async fn test_aging_drift_reconciles() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 100, Some("inv-1".into()));
        h.ledger.set_aging(
            tenant,
            vec![AgingReport {
                tenant_id: tenant,
                side: AgingSide::Receivable,
                bucket_totals_minor: vec![("0-30".into(), 600), ("31-60".into(), 300)],
                source_balance_minor: 1000,
            }],
        );

        let result = h.validator.run_check(CheckKind::AgingReconciliation).await;
        assert_eq!(result.status, CheckStatus::Failed);
        assert!(!h.frozen.is_frozen(tenant));
        assert!(h.validator.escalations().is_empty());
    }

    #[tokio::test]
    async fn test_negative_inventory_escalates_after_failed_reconcile() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.add_inventory(InventoryItem {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            sku: "WIDGET-1".into(),
            quantity: -3,
            unit_cost_minor: 200,
            total_value_minor: -600,
        });

        let result = h.validator.run_check(CheckKind::InventoryValuation).await;
        assert_eq!(result.status, CheckStatus::Failed);
        // Recalculation cannot repair a negative quantity; the tenant stays
        // frozen and the failure lands on the operator queue.
        assert!(h.frozen.is_frozen(tenant));
        assert_eq!(h.validator.escalations().len(), 1);
    }

    #[tokio::test]
    async fn test_hourly_runs_all_five_checks() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger.post_entry(tenant, EntryType::Invoice, 100, Some("inv-1".into()));

        let results = h.validator.run_hourly().await;
        assert_eq!(results.len(), 5);
        let kinds: Vec<CheckKind> = results.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, CheckKind::HOURLY.to_vec());
    }

    #[tokio::test]
    async fn test_resolve_escalation_removes_it() {
        let h = harness();
        let tenant = Uuid::new_v4();
        h.ledger
            .post_entry_with_lines(tenant, EntryType::Payment, 1000, 100, Some("pay-1".into()));
        h.validator.run_check(CheckKind::TrialBalance).await;

        let escalation = h.validator.escalations().pop().unwrap();
        assert!(h.validator.resolve_escalation(escalation.id).is_some());
        assert!(h.validator.escalations().is_empty());
    }
}
