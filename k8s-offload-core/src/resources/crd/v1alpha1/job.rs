use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::WorkloadStatus;

/// A one-shot batch workload executed on the external compute service.
/// The spec is immutable once the resource is created.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "k8s-offload.dev",
    version = "v1alpha1",
    kind = "RemoteJob",
    namespaced,
    status = "WorkloadStatus",
    derive = "Default"
)]
pub struct RemoteJobSpec {
    /// container image to run
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// CPU allocation, e.g. "1.0"
    pub cpu: Option<String>,
    /// memory allocation, e.g. "512Mi"
    pub memory: Option<String>,
    /// GPU specification, e.g. "T4:1"
    pub gpu: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// job timeout in seconds; exceeding it forces the job to Failed
    pub timeout_seconds: Option<u32>,
    pub retries: Option<u32>,
    /// replica count for distributed jobs
    pub replicas: Option<u32>,
    /// enable inter-replica private networking
    pub enable_networking: Option<bool>,
    /// bridge a tunnel from the remote unit into the cluster
    pub tunnel_enabled: Option<bool>,
    pub tunnel_port: Option<u16>,
}
