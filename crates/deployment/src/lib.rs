//! Deployment crate — canary feature-flag rollouts, expand/migrate/contract
//! schema migrations, and the kill-switch write gate every mutating path
//! consults before touching data.

pub mod flags;
pub mod kill_switch;
pub mod migrations;

pub use flags::{FeatureFlag, FeatureFlagManager, FlagScope, FlagState};
pub use kill_switch::{KillSwitch, KillSwitches, WriteGate};
pub use migrations::{
    Migration, MigrationExecutor, MigrationPhase, MigrationRunner, MigrationStatus,
};
