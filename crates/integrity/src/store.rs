//! Ledger store boundary. The validator only ever sees this trait; the
//! relational schema and query layer behind it are out of scope. The
//! in-memory implementation backs tests and local mode.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ledgerpilot_core::types::TenantId;
use ledgerpilot_core::{ControlPlaneError, ControlPlaneResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entries at or above this amount (minor units) are high-value and must
/// carry an idempotency key when their type is mutation-sensitive.
pub const HIGH_VALUE_MINOR: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Invoice,
    Bill,
    Payment,
    Payroll,
    Adjustment,
}

impl EntryType {
    pub fn is_revenue(&self) -> bool {
        matches!(self, Self::Invoice)
    }

    pub fn is_expense(&self) -> bool {
        matches!(self, Self::Bill | Self::Payroll)
    }

    /// Types whose retried mutation must be deduplicated by key.
    pub fn mutation_sensitive(&self) -> bool {
        matches!(self, Self::Invoice | Self::Payment | Self::Payroll)
    }
}

/// A posted ledger entry. Posted entries are immutable by contract;
/// `modified_at` moving past `posted_at` is itself a violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub entry_type: EntryType,
    pub amount_minor: i64,
    pub idempotency_key: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A debit/credit line belonging to a posted entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerLine {
    pub id: Uuid,
    pub entry_id: Uuid,
    pub tenant_id: TenantId,
    pub account: String,
    pub debit_minor: i64,
    pub credit_minor: i64,
}

/// Stored daily P&L figure for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlStatement {
    pub tenant_id: TenantId,
    pub revenue_minor: i64,
    pub expense_minor: i64,
    pub net_minor: i64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub tenant_id: TenantId,
    pub assets_minor: i64,
    pub liabilities_minor: i64,
    pub equity_minor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingSide {
    Receivable,
    Payable,
}

/// Aging report: bucket totals must reconcile to the source balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgingReport {
    pub tenant_id: TenantId,
    pub side: AgingSide,
    pub bucket_totals_minor: Vec<(String, i64)>,
    pub source_balance_minor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub sku: String,
    pub quantity: i64,
    pub unit_cost_minor: i64,
    pub total_value_minor: i64,
}

/// Read/write contract the integrity validator relies on. Regeneration
/// routines are deterministic rebuilds from source entries; they are the
/// only mutations auto-reconciliation is allowed to perform.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    async fn tenant_ids(&self) -> ControlPlaneResult<Vec<TenantId>>;
    async fn entries(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<LedgerEntry>>;
    async fn lines(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<LedgerLine>>;
    async fn stored_pnl(&self, tenant_id: TenantId) -> ControlPlaneResult<Option<PnlStatement>>;
    async fn balance_sheet(&self, tenant_id: TenantId) -> ControlPlaneResult<Option<BalanceSheet>>;
    async fn aging_reports(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<AgingReport>>;
    async fn inventory(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<InventoryItem>>;

    async fn regenerate_pnl(&self, tenant_id: TenantId) -> ControlPlaneResult<()>;
    async fn regenerate_aging(&self, tenant_id: TenantId) -> ControlPlaneResult<()>;
    async fn recalculate_inventory(&self, tenant_id: TenantId) -> ControlPlaneResult<()>;
    async fn remove_orphan_lines(&self, tenant_id: TenantId) -> ControlPlaneResult<u32>;
}

/// DashMap-backed ledger for tests and local mode.
#[derive(Default)]
pub struct InMemoryLedger {
    entries: DashMap<Uuid, LedgerEntry>,
    lines: DashMap<Uuid, LedgerLine>,
    pnl: DashMap<TenantId, PnlStatement>,
    balance_sheets: DashMap<TenantId, BalanceSheet>,
    aging: DashMap<TenantId, Vec<AgingReport>>,
    inventory: DashMap<Uuid, InventoryItem>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post a balanced entry with matching debit/credit lines.
    pub fn post_entry(
        &self,
        tenant_id: TenantId,
        entry_type: EntryType,
        amount_minor: i64,
        idempotency_key: Option<String>,
    ) -> Uuid {
        self.post_entry_with_lines(tenant_id, entry_type, amount_minor, amount_minor, idempotency_key)
    }

    /// Post an entry with explicit (possibly unbalanced) debit and credit
    /// totals. Test hook for imbalance scenarios.
    pub fn post_entry_with_lines(
        &self,
        tenant_id: TenantId,
        entry_type: EntryType,
        debit_minor: i64,
        credit_minor: i64,
        idempotency_key: Option<String>,
    ) -> Uuid {
        let now = Utc::now();
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            tenant_id,
            entry_type,
            amount_minor: debit_minor.max(credit_minor),
            idempotency_key,
            posted_at: now,
            modified_at: now,
        };
        let entry_id = entry.id;
        self.entries.insert(entry_id, entry);

        let debit = LedgerLine {
            id: Uuid::new_v4(),
            entry_id,
            tenant_id,
            account: "debit".to_string(),
            debit_minor,
            credit_minor: 0,
        };
        self.lines.insert(debit.id, debit);
        let credit = LedgerLine {
            id: Uuid::new_v4(),
            entry_id,
            tenant_id,
            account: "credit".to_string(),
            debit_minor: 0,
            credit_minor,
        };
        self.lines.insert(credit.id, credit);
        entry_id
    }

    /// Test hook: mark an entry as modified after posting (an immutability
    /// violation the validator must catch).
    pub fn touch_entry(&self, entry_id: Uuid) -> bool {
        match self.entries.get_mut(&entry_id) {
            Some(mut entry) => {
                entry.modified_at = entry.posted_at + chrono::Duration::seconds(300);
                true
            }
            None => false,
        }
    }

    /// Test hook: insert a line referencing a non-existent parent entry.
    pub fn insert_orphan_line(&self, tenant_id: TenantId, amount_minor: i64) -> Uuid {
        let line = LedgerLine {
            id: Uuid::new_v4(),
            entry_id: Uuid::new_v4(),
            tenant_id,
            account: "orphaned".to_string(),
            debit_minor: amount_minor,
            credit_minor: 0,
        };
        let id = line.id;
        self.lines.insert(id, line);
        id
    }

    pub fn set_pnl(&self, statement: PnlStatement) {
        self.pnl.insert(statement.tenant_id, statement);
    }

    pub fn set_balance_sheet(&self, sheet: BalanceSheet) {
        self.balance_sheets.insert(sheet.tenant_id, sheet);
    }

    pub fn set_aging(&self, tenant_id: TenantId, reports: Vec<AgingReport>) {
        self.aging.insert(tenant_id, reports);
    }

    pub fn add_inventory(&self, item: InventoryItem) {
        self.inventory.insert(item.id, item);
    }

    fn compute_pnl(&self, tenant_id: TenantId) -> PnlStatement {
        let mut revenue = 0i64;
        let mut expenses = 0i64;
        for entry in self.entries.iter() {
            let e = entry.value();
            if e.tenant_id != tenant_id {
                continue;
            }
            if e.entry_type.is_revenue() {
                revenue += e.amount_minor;
            } else if e.entry_type.is_expense() {
                expenses += e.amount_minor;
            }
        }
        PnlStatement {
            tenant_id,
            revenue_minor: revenue,
            expense_minor: expenses,
            net_minor: revenue - expenses,
            generated_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedger {
    async fn tenant_ids(&self) -> ControlPlaneResult<Vec<TenantId>> {
        let mut ids: Vec<TenantId> = self
            .entries
            .iter()
            .map(|e| e.value().tenant_id)
            .collect();
        ids.extend(self.lines.iter().map(|l| l.value().tenant_id));
        ids.extend(self.inventory.iter().map(|i| i.value().tenant_id));
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn entries(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.value().tenant_id == tenant_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn lines(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<LedgerLine>> {
        Ok(self
            .lines
            .iter()
            .filter(|l| l.value().tenant_id == tenant_id)
            .map(|l| l.value().clone())
            .collect())
    }

    async fn stored_pnl(&self, tenant_id: TenantId) -> ControlPlaneResult<Option<PnlStatement>> {
        Ok(self.pnl.get(&tenant_id).map(|p| p.value().clone()))
    }

    async fn balance_sheet(&self, tenant_id: TenantId) -> ControlPlaneResult<Option<BalanceSheet>> {
        Ok(self.balance_sheets.get(&tenant_id).map(|b| b.value().clone()))
    }

    async fn aging_reports(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<AgingReport>> {
        Ok(self
            .aging
            .get(&tenant_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn inventory(&self, tenant_id: TenantId) -> ControlPlaneResult<Vec<InventoryItem>> {
        Ok(self
            .inventory
            .iter()
            .filter(|i| i.value().tenant_id == tenant_id)
            .map(|i| i.value().clone())
            .collect())
    }

    async fn regenerate_pnl(&self, tenant_id: TenantId) -> ControlPlaneResult<()> {
        let statement = self.compute_pnl(tenant_id);
        self.pnl.insert(tenant_id, statement);
        Ok(())
    }

    async fn regenerate_aging(&self, tenant_id: TenantId) -> ControlPlaneResult<()> {
        let mut reports = self
            .aging
            .get(&tenant_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ControlPlaneError::Store(format!("no aging report for {tenant_id}")))?;
        for report in &mut reports {
            // Deterministic rebuild: bucket totals are re-derived so they
            // sum exactly to the source balance.
            let total: i64 = report.bucket_totals_minor.iter().map(|(_, v)| v).sum();
            let drift = report.source_balance_minor - total;
            if let Some(first) = report.bucket_totals_minor.first_mut() {
                first.1 += drift;
            }
        }
        self.aging.insert(tenant_id, reports);
        Ok(())
    }

    async fn recalculate_inventory(&self, tenant_id: TenantId) -> ControlPlaneResult<()> {
        for mut item in self.inventory.iter_mut() {
            if item.tenant_id == tenant_id {
                item.total_value_minor = item.quantity * item.unit_cost_minor;
            }
        }
        Ok(())
    }

    async fn remove_orphan_lines(&self, tenant_id: TenantId) -> ControlPlaneResult<u32> {
        let mut removed = 0u32;
        let orphan_ids: Vec<Uuid> = self
            .lines
            .iter()
            .filter(|l| {
                l.value().tenant_id == tenant_id && !self.entries.contains_key(&l.value().entry_id)
            })
            .map(|l| *l.key())
            .collect();
        for id in orphan_ids {
            if self.lines.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
