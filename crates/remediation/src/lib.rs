//! Remediation crate — the auto-remediator and the infrastructure-executor
//! boundary it dispatches through.

pub mod executor;
pub mod remediator;

pub use executor::{ExecutorCall, InfrastructureExecutor, RecordingExecutor};
pub use remediator::{ActionType, AutoRemediator, RemediationAction};
