//! Alert bus — trait for emitting operator alerts from any component.
//!
//! Components accept an `Arc<dyn AlertSink>`; the concrete sink routes
//! alerts to the bounded in-memory log consumed by the dashboard. Delivery
//! to email/chat lives behind this boundary and is not implemented here.

use crate::types::{Alert, AlertSeverity};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};

pub trait AlertSink: Send + Sync {
    fn emit(&self, alert: Alert);
}

/// No-op sink for components that don't need alert emission.
pub struct NoOpSink;

impl AlertSink for NoOpSink {
    fn emit(&self, _alert: Alert) {}
}

/// In-memory sink that captures alerts for testing.
#[derive(Default)]
pub struct CaptureSink {
    alerts: Mutex<Vec<Alert>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn count_severity(&self, severity: AlertSeverity) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.severity == severity)
            .count()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }
}

impl AlertSink for CaptureSink {
    fn emit(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

/// Bounded alert history. Every emitted alert lands here; the oldest entry
/// is evicted once capacity is reached. Also writes a structured tracing
/// event per alert so silent failure is impossible.
pub struct AlertLog {
    history: Mutex<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }
}

impl AlertSink for AlertLog {
    fn emit(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Info | AlertSeverity::Notice => info!(
                category = ?alert.category,
                tenant = ?alert.tenant_id,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                category = ?alert.category,
                tenant = ?alert.tenant_id,
                "{}",
                alert.message
            ),
            AlertSeverity::Critical | AlertSeverity::Page => error!(
                category = ?alert.category,
                tenant = ?alert.tenant_id,
                severity = ?alert.severity,
                "{}",
                alert.message
            ),
        }

        let mut history = self.history.lock();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(alert);
    }
}

/// Fan-out sink: delivers each alert to every registered sink.
pub struct FanOutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanOutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

impl AlertSink for FanOutSink {
    fn emit(&self, alert: Alert) {
        for sink in &self.sinks {
            sink.emit(alert.clone());
        }
    }
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

/// Convenience: create a no-op sink.
pub fn noop_sink() -> Arc<dyn AlertSink> {
    Arc::new(NoOpSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AlertCategory;

    fn alert(severity: AlertSeverity) -> Alert {
        Alert::new(severity, AlertCategory::Health, "test alert")
    }

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        sink.emit(alert(AlertSeverity::Info));
        sink.emit(alert(AlertSeverity::Page));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_severity(AlertSeverity::Page), 1);
    }

    #[test]
    fn test_alert_log_bounded() {
        let log = AlertLog::new(3);
        for _ in 0..10 {
            log.emit(alert(AlertSeverity::Warning));
        }
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_recent_is_newest_first() {
        let log = AlertLog::new(10);
        log.emit(Alert::new(AlertSeverity::Info, AlertCategory::Health, "first"));
        log.emit(Alert::new(AlertSeverity::Info, AlertCategory::Health, "second"));

        let recent = log.recent(2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
    }

    #[test]
    fn test_fan_out() {
        let a = capture_sink();
        let b = capture_sink();
        let fan = FanOutSink::new(vec![a.clone(), b.clone()]);
        fan.emit(alert(AlertSeverity::Notice));

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }
}
