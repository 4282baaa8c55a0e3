use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
        ContainerStatus, Pod, PodStatus,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};

use crate::{
    remote::{RemoteExecutionHandle, RemotePhase, RemoteStatus},
    resources::crd::v1alpha1::WorkloadPhase,
    REMOTE_HOST_SENTINEL,
};

/// Collapses a remote status poll into a single workload phase.
///
/// Succeeded requires every replica to have succeeded. A single replica
/// failing non-retryably fails the whole workload; retryable failures are
/// left for the service to reschedule and the workload stays Running.
pub fn aggregate_phase(status: &RemoteStatus) -> WorkloadPhase {
    if status
        .replicas
        .iter()
        .any(|replica| replica.phase == RemotePhase::Failed && !replica.retryable)
    {
        return WorkloadPhase::Failed;
    }

    if !status.replicas.is_empty()
        && status
            .replicas
            .iter()
            .all(|replica| replica.phase == RemotePhase::Succeeded)
    {
        return WorkloadPhase::Succeeded;
    }

    if status
        .replicas
        .iter()
        .any(|replica| replica.phase == RemotePhase::Running)
    {
        return WorkloadPhase::Running;
    }

    match status.accepted {
        true => WorkloadPhase::Creating,
        false => WorkloadPhase::Pending,
    }
}

/// Builds the status of an intercepted pod so kubectl shows the remote
/// execution as if it ran in-cluster. The placeholder containers report
/// the remote unit's function id as their image and the host IP carries
/// a sentinel that marks the pod as remotely scheduled.
pub fn synthesize_pod_status(
    pod: &Pod,
    handle: &RemoteExecutionHandle,
    phase: WorkloadPhase,
    now: DateTime<Utc>,
) -> PodStatus {
    let container_names = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .map(|container| container.name.clone());

    let container_statuses = container_names
        .map(|name| ContainerStatus {
            name,
            image: handle.primary_function_id().to_owned(),
            image_id: format!("remote://{}", handle.app_id),
            ready: phase == WorkloadPhase::Running,
            started: Some(phase == WorkloadPhase::Running),
            restart_count: 0,
            state: Some(container_state(phase, now)),
            ..Default::default()
        })
        .collect();

    PodStatus {
        phase: Some(pod_phase(phase).to_owned()),
        host_ip: Some(REMOTE_HOST_SENTINEL.to_owned()),
        message: Some(format!("Offloaded to remote app '{}'", handle.app_id)),
        container_statuses: Some(container_statuses),
        ..pod.status.clone().unwrap_or_default()
    }
}

fn pod_phase(phase: WorkloadPhase) -> &'static str {
    match phase {
        WorkloadPhase::Pending | WorkloadPhase::Creating => "Pending",
        WorkloadPhase::Running | WorkloadPhase::Terminating => "Running",
        WorkloadPhase::Succeeded => "Succeeded",
        WorkloadPhase::Failed => "Failed",
    }
}

fn container_state(phase: WorkloadPhase, now: DateTime<Utc>) -> ContainerState {
    match phase {
        WorkloadPhase::Pending | WorkloadPhase::Creating => ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("RemoteUnitStarting".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        WorkloadPhase::Running | WorkloadPhase::Terminating => ContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(Time(now)),
            }),
            ..Default::default()
        },
        WorkloadPhase::Succeeded => ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                reason: Some("Completed".to_owned()),
                finished_at: Some(Time(now)),
                ..Default::default()
            }),
            ..Default::default()
        },
        WorkloadPhase::Failed => ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 1,
                reason: Some("RemoteUnitFailed".to_owned()),
                finished_at: Some(Time(now)),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    use crate::remote::RemoteReplicaStatus;

    use super::*;

    fn replica(rank: u32, phase: RemotePhase, retryable: bool) -> RemoteReplicaStatus {
        RemoteReplicaStatus {
            rank,
            phase,
            retryable,
            ..Default::default()
        }
    }

    fn status_of(replicas: Vec<RemoteReplicaStatus>) -> RemoteStatus {
        RemoteStatus {
            accepted: true,
            replicas,
            url: None,
        }
    }

    #[test]
    fn succeeded_requires_every_replica() {
        let partial = status_of(vec![
            replica(0, RemotePhase::Succeeded, false),
            replica(1, RemotePhase::Running, false),
        ]);
        let complete = status_of(vec![
            replica(0, RemotePhase::Succeeded, false),
            replica(1, RemotePhase::Succeeded, false),
        ]);

        assert_eq!(aggregate_phase(&partial), WorkloadPhase::Running);
        assert_eq!(aggregate_phase(&complete), WorkloadPhase::Succeeded);
    }

    #[test]
    fn one_fatal_replica_fails_the_workload() {
        let status = status_of(vec![
            replica(0, RemotePhase::Running, false),
            replica(1, RemotePhase::Failed, false),
        ]);

        assert_eq!(aggregate_phase(&status), WorkloadPhase::Failed);
    }

    #[test]
    fn retryable_failures_keep_the_workload_running() {
        let status = status_of(vec![
            replica(0, RemotePhase::Running, false),
            replica(1, RemotePhase::Failed, true),
        ]);

        assert_eq!(aggregate_phase(&status), WorkloadPhase::Running);
    }

    #[test]
    fn unaccepted_unit_is_still_pending() {
        let status = RemoteStatus::default();

        assert_eq!(aggregate_phase(&status), WorkloadPhase::Pending);
    }

    #[test]
    fn synthesized_pod_status_marks_remote_scheduling() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "trainer".to_owned(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let handle = RemoteExecutionHandle {
            app_id: "ap-123".to_owned(),
            function_ids: vec!["fn-456".to_owned()],
            ..Default::default()
        };

        let status = synthesize_pod_status(&pod, &handle, WorkloadPhase::Running, Utc::now());

        assert_eq!(status.phase.as_deref(), Some("Running"));
        assert_eq!(status.host_ip.as_deref(), Some(REMOTE_HOST_SENTINEL));

        let containers = status.container_statuses.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].image, "fn-456");
        assert!(containers[0].ready);
    }
}
