//! Capacity crate — tenant-count utilization tracking against the current
//! tier, edge-triggered threshold actions, growth projection, and the
//! seven-phase tier-upgrade state machine.

pub mod planner;
pub mod upgrade;

pub use planner::{CapacityPlanner, CapacityStatus, CapacityTier, GrowthProjection};
pub use upgrade::{TierUpgrader, UpgradeOutcome, UpgradePhase, UpgradeState};
