//! Telemetry crate — metrics collection and health evaluation.

pub mod collector;
pub mod health;

pub use collector::{MetricsCollector, MetricsPatch, MetricsSnapshot, MetricsSource};
pub use health::{HealthEvaluator, HealthReport, HealthTransition, ThresholdTable};
