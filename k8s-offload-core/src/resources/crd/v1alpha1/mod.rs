use std::fmt::Display;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{remote::RemoteExecutionHandle, status::coordinator::ReplicaState};

pub mod endpoint;
pub mod function;
pub mod job;

/// Lifecycle phase shared by all three offloaded resource kinds.
///
/// Transitions are monotonic with a single exception: a transient remote
/// error during creation reverts Creating back to Pending for the retry.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum WorkloadPhase {
    #[default]
    Pending,
    Creating,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

impl Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkloadPhase::Pending => f.write_str("waiting for the remote unit to be created"),
            WorkloadPhase::Creating => f.write_str("remote unit is being created"),
            WorkloadPhase::Running => f.write_str("remote unit is running"),
            WorkloadPhase::Succeeded => f.write_str("remote unit finished successfully"),
            WorkloadPhase::Failed => f.write_str("remote unit failed"),
            WorkloadPhase::Terminating => f.write_str("remote unit is being torn down"),
        }
    }
}

/// Status shared by RemoteJob, RemoteEndpoint and RemoteFunction.
///
/// Everything a reconcile pass needs to resume after a restart lives here,
/// never only in memory: the handle, the phase, and the retry counters.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub phase: WorkloadPhase,
    pub handle: Option<RemoteExecutionHandle>,
    #[serde(default)]
    pub replicas: Vec<ReplicaState>,
    /// consecutive transient-error retries, drives the requeue backoff
    #[serde(default)]
    pub retries: u32,
    /// failed destroy() attempts while Terminating
    #[serde(default)]
    pub teardown_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl WorkloadStatus {
    pub fn transition(&mut self, phase: WorkloadPhase, message: impl Into<String>, now: DateTime<Utc>) {
        if self.phase != phase {
            self.last_transition_time = Some(now);
        }

        self.phase = phase;
        self.message = Some(message.into());
    }
}
