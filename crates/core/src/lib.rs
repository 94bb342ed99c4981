pub mod alerts;
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{ControlPlaneError, ControlPlaneResult};
