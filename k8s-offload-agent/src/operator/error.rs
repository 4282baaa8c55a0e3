use k8s_offload_core::workload::ValidationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("Workload validation failed! Reason: {}", .0)]
    ValidationError(ValidationError),
    #[error("Couldn't patch the resource! Reason: {}", .0)]
    KubeApiError(kube::Error),
    #[error("Remote teardown failed {} time(s), the finalizer stays until it succeeds!", .attempts)]
    TeardownFailed { attempts: u32 },
}
