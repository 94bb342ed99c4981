//! Infrastructure-executor contract. The concrete orchestration platform
//! behind it (cluster API, container runtime) is out of scope; the control
//! plane only ever calls this interface.

use ledgerpilot_core::ControlPlaneResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One recorded call into the executor, for tests and local mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "call")]
pub enum ExecutorCall {
    ScaleWorkers { delta: i32 },
    RestartService { name: String },
    TerminateLongRunningOperations { threshold_secs: u64 },
    ProvisionReadReplica,
    ProvisionCachingLayer,
    ProvisionConnectionPool,
}

#[async_trait::async_trait]
pub trait InfrastructureExecutor: Send + Sync {
    async fn scale_workers(&self, delta: i32) -> ControlPlaneResult<()>;
    async fn restart_service(&self, name: &str) -> ControlPlaneResult<()>;
    async fn terminate_long_running_operations(
        &self,
        threshold_secs: u64,
    ) -> ControlPlaneResult<()>;
    async fn provision_read_replica(&self) -> ControlPlaneResult<()>;
    async fn provision_caching_layer(&self) -> ControlPlaneResult<()>;
    async fn provision_connection_pool(&self) -> ControlPlaneResult<()>;
}

/// Executor that records every call instead of touching real infrastructure.
/// Individual operations can be told to fail, for failure-path tests.
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ExecutorCall>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Make the named operation fail until `clear_failures` is called.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    fn record(&self, op: &'static str, call: ExecutorCall) -> ControlPlaneResult<()> {
        if self.failing.lock().contains(op) {
            return Err(ledgerpilot_core::ControlPlaneError::Executor(format!(
                "simulated failure: {op}"
            )));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait::async_trait]
impl InfrastructureExecutor for RecordingExecutor {
    async fn scale_workers(&self, delta: i32) -> ControlPlaneResult<()> {
        self.record("scale_workers", ExecutorCall::ScaleWorkers { delta })
    }

    async fn restart_service(&self, name: &str) -> ControlPlaneResult<()> {
        self.record(
            "restart_service",
            ExecutorCall::RestartService {
                name: name.to_string(),
            },
        )
    }

    async fn terminate_long_running_operations(
        &self,
        threshold_secs: u64,
    ) -> ControlPlaneResult<()> {
        self.record(
            "terminate_long_running_operations",
            ExecutorCall::TerminateLongRunningOperations { threshold_secs },
        )
    }

    async fn provision_read_replica(&self) -> ControlPlaneResult<()> {
        self.record("provision_read_replica", ExecutorCall::ProvisionReadReplica)
    }

    async fn provision_caching_layer(&self) -> ControlPlaneResult<()> {
        self.record("provision_caching_layer", ExecutorCall::ProvisionCachingLayer)
    }

    async fn provision_connection_pool(&self) -> ControlPlaneResult<()> {
        self.record(
            "provision_connection_pool",
            ExecutorCall::ProvisionConnectionPool,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_executor_records_calls() {
        let exec = RecordingExecutor::new();
        exec.scale_workers(2).await.unwrap();
        exec.restart_service("api").await.unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ExecutorCall::ScaleWorkers { delta: 2 });
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let exec = RecordingExecutor::new();
        exec.fail_on("scale_workers");
        assert!(exec.scale_workers(1).await.is_err());
        assert_eq!(exec.call_count(), 0);

        exec.clear_failures();
        assert!(exec.scale_workers(1).await.is_ok());
    }
}
