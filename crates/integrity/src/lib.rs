//! Integrity crate — double-entry correctness checks against the ledger,
//! the frozen-tenant write authority, and the freeze/reconcile/escalate
//! failure protocol.

pub mod freeze;
pub mod store;
pub mod validator;

pub use freeze::{FreezeRecord, FrozenTenantSet};
pub use store::{InMemoryLedger, LedgerStore};
pub use validator::{CheckKind, CheckStatus, FinancialIntegrityValidator, ValidationResult};
