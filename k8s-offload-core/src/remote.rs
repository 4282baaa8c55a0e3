use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Reference to a compute unit living on the external service. Written to a
/// resource's status on the first successful remote create and cleared only
/// when the unit is torn down. A resource holds at most one handle.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteExecutionHandle {
    pub app_id: String,
    #[serde(default)]
    pub function_ids: Vec<String>,
    /// address of the private tunnel into the remote unit, if one was opened
    pub tunnel_url: Option<String>,
    /// stable URL issued for persistent (endpoint/function) deployments
    pub endpoint_url: Option<String>,
}

impl RemoteExecutionHandle {
    /// Identifier shown as the placeholder container's image.
    pub fn primary_function_id(&self) -> &str {
        self.function_ids
            .first()
            .map(String::as_str)
            .unwrap_or(self.app_id.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemotePhase {
    #[default]
    Queued,
    Starting,
    Running,
    Succeeded,
    Failed,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReplicaStatus {
    pub rank: u32,
    #[serde(default)]
    pub phase: RemotePhase,
    /// only meaningful when `phase` is `Failed`
    #[serde(default)]
    pub retryable: bool,
    pub heartbeat: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Snapshot returned by a poll of the external service.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    /// the service acknowledged the unit and began scheduling it
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub replicas: Vec<RemoteReplicaStatus>,
    /// stable URL, present once a persistent deployment is routable
    pub url: Option<String>,
}
