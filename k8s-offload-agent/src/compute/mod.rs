use async_trait::async_trait;
use k8s_offload_core::{
    remote::{RemoteExecutionHandle, RemoteStatus},
    workload::WorkloadSpec,
};
use thiserror::Error;

pub mod http;
pub mod mock;

#[derive(Debug, Error)]
pub enum ComputeError {
    /// network trouble, quotas, rate limits, deadlines; safe to retry
    #[error("The compute service call failed transiently! Reason: {}", .0)]
    Transient(String),
    /// the service rejected the workload; retrying cannot help
    #[error("The compute service rejected the workload! Reason: {}", .0)]
    Rejected(String),
    #[error("The compute service couldn't tear the unit down! Reason: {}", .0)]
    Teardown(String),
}

impl ComputeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_) | ComputeError::Teardown(_))
    }
}

/// The external compute service, reduced to the five calls the operator
/// needs. Every implementation must make `create` idempotent per key so a
/// reconcile pass can be abandoned and retried at any point.
#[async_trait]
pub trait ComputeService: Send + Sync {
    /// Creates a one-shot unit, or returns the unit already created under
    /// the same idempotency key.
    async fn create(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError>;

    /// Deploys a persistent unit with a stable URL, idempotent like `create`.
    async fn deploy_persistent(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError>;

    /// Resolves an idempotency key to the unit it created, if any.
    async fn lookup(&self, key: &str) -> Result<Option<RemoteExecutionHandle>, ComputeError>;

    async fn poll(&self, handle: &RemoteExecutionHandle) -> Result<RemoteStatus, ComputeError>;

    async fn destroy(&self, handle: &RemoteExecutionHandle) -> Result<(), ComputeError>;

    /// Opens a tunnel to the given port of the unit, returning its URL.
    async fn create_tunnel(
        &self,
        handle: &RemoteExecutionHandle,
        port: u16,
    ) -> Result<String, ComputeError>;
}
