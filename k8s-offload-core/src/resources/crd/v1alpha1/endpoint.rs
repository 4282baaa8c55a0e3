use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::WorkloadStatus;

/// An HTTP server deployed persistently on the external compute service.
/// Never self-terminates; only an explicit delete ends it.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "k8s-offload.dev",
    version = "v1alpha1",
    kind = "RemoteEndpoint",
    namespaced,
    status = "WorkloadStatus",
    derive = "Default"
)]
pub struct RemoteEndpointSpec {
    /// container image for the HTTP server
    pub image: String,
    /// handler entrypoint when no command is given
    pub handler: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub gpu: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
