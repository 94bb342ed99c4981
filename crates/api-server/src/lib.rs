//! Control-plane API — the aggregated dashboard read model, authenticated
//! command endpoints, and the snapshot push channel.

pub mod rest;
pub mod server;
pub mod state;

pub use server::ApiServer;
pub use state::{ControlPlane, DashboardSnapshot};
