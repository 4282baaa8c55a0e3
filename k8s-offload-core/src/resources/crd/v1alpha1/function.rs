use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::WorkloadStatus;

/// A serverless function deployed persistently on the external compute
/// service, invoked through its stable URL.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "k8s-offload.dev",
    version = "v1alpha1",
    kind = "RemoteFunction",
    namespaced,
    status = "WorkloadStatus",
    derive = "Default"
)]
pub struct RemoteFunctionSpec {
    /// container image providing the handler
    pub image: String,
    /// handler entrypoint, e.g. "app.process_image"
    pub handler: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub gpu: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_seconds: Option<u32>,
    /// max concurrent invocations
    pub concurrency: Option<u32>,
}
