use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_offload_core::{
    backoff::REMOTE_CALL_BACKOFF,
    resources::crd::v1alpha1::{WorkloadPhase, WorkloadStatus},
    status::{
        coordinator::{all_ready, observe, plan_replicas, stalled_ranks},
        mapper::aggregate_phase,
    },
    workload::{idempotency_key, WorkloadSpec},
};
use log::{error, info, warn};

use crate::{compute::ComputeService, metrics::Metrics};

pub const POLL_REQUEUE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// runs to completion, subject to the workload timeout
    OneShot,
    /// keeps serving until the resource is deleted
    Persistent,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Requeue(Duration),
    /// terminal phase reached, wait for the object to change
    Idle,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// the remote unit is gone (or never existed), the finalizer may go
    Finished,
    /// teardown unconfirmed, the finalizer must stay
    Blocked { attempts: u32, retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl ResourceIdentity {
    pub fn key(&self) -> String {
        idempotency_key(&self.namespace, &self.name, &self.uid)
    }
}

/// Drives a workload's status one step forward. All remote-error handling
/// is folded into the returned status mutation: transient errors revert
/// Creating to Pending and back off, rejections go straight to Failed.
pub async fn advance(
    mode: ExecutionMode,
    identity: &ResourceIdentity,
    workload: &WorkloadSpec,
    status: &mut WorkloadStatus,
    compute: &dyn ComputeService,
    metrics: &Metrics,
    now: DateTime<Utc>,
) -> StepOutcome {
    if status.phase.is_terminal() {
        return StepOutcome::Idle;
    }

    match status.handle.clone() {
        None => create_unit(mode, identity, workload, status, compute, metrics, now).await,
        Some(_) => poll_unit(mode, identity, workload, status, compute, metrics, now).await,
    }
}

async fn create_unit(
    mode: ExecutionMode,
    identity: &ResourceIdentity,
    workload: &WorkloadSpec,
    status: &mut WorkloadStatus,
    compute: &dyn ComputeService,
    metrics: &Metrics,
    now: DateTime<Utc>,
) -> StepOutcome {
    let key = identity.key();
    let created = match mode {
        ExecutionMode::OneShot => compute.create(&key, workload).await,
        ExecutionMode::Persistent => compute.deploy_persistent(&key, workload).await,
    };

    match created {
        Ok(handle) => {
            info!(
                "Remote unit '{}' created for '{}/{}'",
                handle.app_id, identity.namespace, identity.name
            );

            Metrics::increment(&metrics.remote_creates);

            status.transition(
                WorkloadPhase::Creating,
                format!("Remote unit '{}' created", handle.app_id),
                now,
            );
            status.handle = Some(handle);
            status.retries = 0;
            status.replicas = plan_replicas(workload.replicas);

            StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS))
        }
        Err(err) if err.is_transient() => transient_setback(status, metrics, &err.to_string(), now),
        Err(err) => {
            status.transition(WorkloadPhase::Failed, err.to_string(), now);

            StepOutcome::Idle
        }
    }
}

async fn poll_unit(
    mode: ExecutionMode,
    identity: &ResourceIdentity,
    workload: &WorkloadSpec,
    status: &mut WorkloadStatus,
    compute: &dyn ComputeService,
    metrics: &Metrics,
    now: DateTime<Utc>,
) -> StepOutcome {
    // unwrap is fine, advance() only dispatches here with a handle present
    let mut handle = status.handle.clone().unwrap();

    let remote = match compute.poll(&handle).await {
        Ok(remote) => remote,
        Err(err) if err.is_transient() => {
            Metrics::increment(&metrics.transient_retries);

            let attempt = status.retries;
            status.retries += 1;

            return StepOutcome::Requeue(REMOTE_CALL_BACKOFF.delay(attempt));
        }
        Err(err) => {
            status.transition(WorkloadPhase::Failed, err.to_string(), now);

            return StepOutcome::Idle;
        }
    };

    status.retries = 0;
    observe(&mut status.replicas, &remote.replicas, now);

    if let Some(url) = &remote.url {
        if handle.endpoint_url.as_deref() != Some(url) {
            handle.endpoint_url = Some(url.clone());
            status.handle = Some(handle.clone());
        }
    }

    let mapped = aggregate_phase(&remote);

    if mapped == WorkloadPhase::Failed {
        status.transition(WorkloadPhase::Failed, "A replica failed non-retryably", now);

        return StepOutcome::Idle;
    }

    match status.phase {
        WorkloadPhase::Pending | WorkloadPhase::Creating => {
            if mode == ExecutionMode::OneShot && mapped == WorkloadPhase::Succeeded {
                status.transition(WorkloadPhase::Succeeded, "Remote unit finished", now);

                return StepOutcome::Idle;
            }

            let ready = match mode {
                ExecutionMode::OneShot => remote.accepted && all_ready(&status.replicas),
                ExecutionMode::Persistent => remote.url.is_some(),
            };

            if !ready {
                return StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS));
            }

            if let Some(tunnel) = &workload.tunnel {
                match compute.create_tunnel(&handle, tunnel.port).await {
                    Ok(url) => {
                        handle.tunnel_url = Some(url);
                        status.handle = Some(handle.clone());
                    }
                    Err(err) if err.is_transient() => {
                        return transient_setback(status, metrics, &err.to_string(), now);
                    }
                    Err(err) => {
                        status.transition(WorkloadPhase::Failed, err.to_string(), now);

                        return StepOutcome::Idle;
                    }
                }
            }

            status.started_at = Some(now);
            status.transition(WorkloadPhase::Running, "Remote unit is running", now);

            StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS))
        }
        WorkloadPhase::Running => {
            if mode == ExecutionMode::OneShot {
                if let Some(outcome) =
                    enforce_timeout(identity, workload, status, &handle, compute, now).await
                {
                    return outcome;
                }

                if mapped == WorkloadPhase::Succeeded {
                    status.transition(WorkloadPhase::Succeeded, "Remote unit finished", now);

                    return StepOutcome::Idle;
                }

                let stalled = stalled_ranks(&status.replicas, now);
                if !stalled.is_empty() {
                    status.transition(
                        WorkloadPhase::Failed,
                        format!("Replica(s) {stalled:?} stopped heartbeating"),
                        now,
                    );

                    return StepOutcome::Idle;
                }
            }

            StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS))
        }
        _ => StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS)),
    }
}

async fn enforce_timeout(
    identity: &ResourceIdentity,
    workload: &WorkloadSpec,
    status: &mut WorkloadStatus,
    handle: &k8s_offload_core::remote::RemoteExecutionHandle,
    compute: &dyn ComputeService,
    now: DateTime<Utc>,
) -> Option<StepOutcome> {
    let started_at = status.started_at?;
    let timeout = chrono::Duration::from_std(workload.timeout).ok()?;

    if now - started_at <= timeout {
        return None;
    }

    status.transition(
        WorkloadPhase::Failed,
        format!("Exceeded the {}s timeout", workload.timeout.as_secs()),
        now,
    );

    // best effort; the finalizer retries teardown if this fails
    if let Err(err) = compute.destroy(handle).await {
        warn!(
            "Couldn't tear down timed-out unit '{}' for '{}/{}'! {err:?}",
            handle.app_id, identity.namespace, identity.name
        );
    } else {
        status.handle = None;
    }

    Some(StepOutcome::Idle)
}

fn transient_setback(
    status: &mut WorkloadStatus,
    metrics: &Metrics,
    message: &str,
    now: DateTime<Utc>,
) -> StepOutcome {
    Metrics::increment(&metrics.transient_retries);

    let attempt = status.retries;
    status.retries += 1;
    status.transition(WorkloadPhase::Pending, message, now);

    StepOutcome::Requeue(REMOTE_CALL_BACKOFF.delay(attempt))
}

/// Tears the remote unit down ahead of finalizer removal.
///
/// When no handle was persisted the idempotency key is still resolved
/// against the service, covering a crash between the remote create and
/// the first status write. Skipping teardown is only valid when that
/// lookup confirms no unit exists.
pub async fn cleanup(
    identity: &ResourceIdentity,
    status: &mut WorkloadStatus,
    compute: &dyn ComputeService,
    metrics: &Metrics,
    alert_threshold: u32,
    now: DateTime<Utc>,
) -> CleanupOutcome {
    let handle = match status.handle.clone() {
        Some(handle) => Some(handle),
        None => match compute.lookup(&identity.key()).await {
            Ok(handle) => handle,
            Err(err) => return teardown_setback(identity, status, metrics, alert_threshold, &err.to_string(), now),
        },
    };

    let Some(handle) = handle else {
        return CleanupOutcome::Finished;
    };

    match compute.destroy(&handle).await {
        Ok(()) => {
            info!(
                "Remote unit '{}' torn down for '{}/{}'",
                handle.app_id, identity.namespace, identity.name
            );

            Metrics::increment(&metrics.remote_teardowns);

            status.handle = None;
            status.transition(WorkloadPhase::Terminating, "Remote unit torn down", now);

            CleanupOutcome::Finished
        }
        Err(err) => teardown_setback(identity, status, metrics, alert_threshold, &err.to_string(), now),
    }
}

fn teardown_setback(
    identity: &ResourceIdentity,
    status: &mut WorkloadStatus,
    metrics: &Metrics,
    alert_threshold: u32,
    message: &str,
    now: DateTime<Utc>,
) -> CleanupOutcome {
    Metrics::increment(&metrics.teardown_failures);

    let attempt = status.teardown_attempts;
    status.teardown_attempts += 1;
    status.transition(WorkloadPhase::Terminating, message, now);

    if status.teardown_attempts >= alert_threshold {
        error!(
            "Teardown for '{}/{}' has failed {} times, a remote unit may be leaking spend!",
            identity.namespace, identity.name, status.teardown_attempts
        );
    }

    CleanupOutcome::Blocked {
        attempts: status.teardown_attempts,
        retry_in: REMOTE_CALL_BACKOFF.delay(attempt),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
    };

    use async_trait::async_trait;
    use k8s_offload_core::{
        remote::{RemoteExecutionHandle, RemotePhase, RemoteReplicaStatus, RemoteStatus},
        resources::crd::v1alpha1::job::RemoteJobSpec,
    };

    use crate::compute::ComputeError;

    use super::*;

    #[derive(Default)]
    struct ScriptedCompute {
        create_results: Mutex<VecDeque<Result<RemoteExecutionHandle, ComputeError>>>,
        poll_results: Mutex<VecDeque<Result<RemoteStatus, ComputeError>>>,
        destroy_results: Mutex<VecDeque<Result<(), ComputeError>>>,
        lookup_result: Mutex<Option<RemoteExecutionHandle>>,
        create_calls: AtomicU32,
        destroy_calls: AtomicU32,
    }

    #[async_trait]
    impl ComputeService for ScriptedCompute {
        async fn create(
            &self,
            _key: &str,
            _workload: &WorkloadSpec,
        ) -> Result<RemoteExecutionHandle, ComputeError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.create_results.lock().unwrap().pop_front().unwrap()
        }

        async fn deploy_persistent(
            &self,
            key: &str,
            workload: &WorkloadSpec,
        ) -> Result<RemoteExecutionHandle, ComputeError> {
            self.create(key, workload).await
        }

        async fn lookup(&self, _key: &str) -> Result<Option<RemoteExecutionHandle>, ComputeError> {
            Ok(self.lookup_result.lock().unwrap().clone())
        }

        async fn poll(
            &self,
            _handle: &RemoteExecutionHandle,
        ) -> Result<RemoteStatus, ComputeError> {
            self.poll_results.lock().unwrap().pop_front().unwrap()
        }

        async fn destroy(&self, _handle: &RemoteExecutionHandle) -> Result<(), ComputeError> {
            self.destroy_calls.fetch_add(1, Ordering::SeqCst);
            self.destroy_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn create_tunnel(
            &self,
            handle: &RemoteExecutionHandle,
            port: u16,
        ) -> Result<String, ComputeError> {
            Ok(format!("{}.tunnel:{port}", handle.app_id))
        }
    }

    fn handle() -> RemoteExecutionHandle {
        RemoteExecutionHandle {
            app_id: "ap-1".to_owned(),
            function_ids: vec!["fn-1".to_owned()],
            ..Default::default()
        }
    }

    fn identity() -> ResourceIdentity {
        ResourceIdentity {
            namespace: "default".to_owned(),
            name: "train".to_owned(),
            uid: "uid-1".to_owned(),
        }
    }

    fn workload(replicas: u32) -> WorkloadSpec {
        WorkloadSpec::from_job(&RemoteJobSpec {
            image: "busybox".to_owned(),
            replicas: Some(replicas),
            ..Default::default()
        })
        .unwrap()
    }

    fn remote(phases: &[(RemotePhase, bool)]) -> RemoteStatus {
        RemoteStatus {
            accepted: true,
            replicas: phases
                .iter()
                .enumerate()
                .map(|(rank, (phase, retryable))| RemoteReplicaStatus {
                    rank: rank as u32,
                    phase: *phase,
                    retryable: *retryable,
                    heartbeat: Some(Utc::now()),
                    message: None,
                })
                .collect(),
            url: None,
        }
    }

    #[tokio::test]
    async fn transient_create_errors_keep_pending_and_back_off() {
        let compute = ScriptedCompute::default();
        compute.create_results.lock().unwrap().extend([
            Err(ComputeError::Transient("quota".into())),
            Err(ComputeError::Transient("quota".into())),
            Ok(handle()),
        ]);
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();

        let first = advance(
            ExecutionMode::OneShot,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;
        assert_eq!(first, StepOutcome::Requeue(Duration::from_secs(2)));
        assert_eq!(status.phase, WorkloadPhase::Pending);
        assert_eq!(status.retries, 1);

        let second = advance(
            ExecutionMode::OneShot,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;
        assert_eq!(second, StepOutcome::Requeue(Duration::from_secs(4)));
        assert_eq!(status.retries, 2);

        advance(
            ExecutionMode::OneShot,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;
        assert_eq!(status.phase, WorkloadPhase::Creating);
        assert_eq!(status.retries, 0);
        assert!(status.handle.is_some());
    }

    #[tokio::test]
    async fn a_persisted_handle_never_triggers_a_second_create() {
        let compute = ScriptedCompute::default();
        compute
            .create_results
            .lock()
            .unwrap()
            .push_back(Ok(handle()));
        compute.poll_results.lock().unwrap().extend([
            Ok(remote(&[(RemotePhase::Running, false)])),
            Ok(remote(&[(RemotePhase::Running, false)])),
        ]);
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();

        for _ in 0..3 {
            advance(
                ExecutionMode::OneShot,
                &identity(),
                &workload(1),
                &mut status,
                &compute,
                &metrics,
                Utc::now(),
            )
            .await;
        }

        assert_eq!(compute.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(status.phase, WorkloadPhase::Running);
    }

    #[tokio::test]
    async fn rejected_creates_fail_immediately() {
        let compute = ScriptedCompute::default();
        compute
            .create_results
            .lock()
            .unwrap()
            .push_back(Err(ComputeError::Rejected("bad image".into())));
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();

        let outcome = advance(
            ExecutionMode::OneShot,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;

        assert_eq!(outcome, StepOutcome::Idle);
        assert_eq!(status.phase, WorkloadPhase::Failed);
        assert!(status.handle.is_none());
    }

    #[tokio::test]
    async fn distributed_jobs_wait_for_every_replica() {
        let compute = ScriptedCompute::default();
        compute
            .create_results
            .lock()
            .unwrap()
            .push_back(Ok(handle()));
        compute.poll_results.lock().unwrap().extend([
            Ok(remote(&[
                (RemotePhase::Running, false),
                (RemotePhase::Starting, false),
            ])),
            Ok(remote(&[
                (RemotePhase::Running, false),
                (RemotePhase::Running, false),
            ])),
            Ok(remote(&[
                (RemotePhase::Succeeded, false),
                (RemotePhase::Running, false),
            ])),
            Ok(remote(&[
                (RemotePhase::Succeeded, false),
                (RemotePhase::Succeeded, false),
            ])),
        ]);
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();
        let workload = workload(2);

        advance(ExecutionMode::OneShot, &identity(), &workload, &mut status, &compute, &metrics, Utc::now()).await;
        assert_eq!(status.replicas.len(), 2);
        assert_eq!(status.replicas[1].world_size, 2);

        advance(ExecutionMode::OneShot, &identity(), &workload, &mut status, &compute, &metrics, Utc::now()).await;
        assert_eq!(status.phase, WorkloadPhase::Creating);

        advance(ExecutionMode::OneShot, &identity(), &workload, &mut status, &compute, &metrics, Utc::now()).await;
        assert_eq!(status.phase, WorkloadPhase::Running);

        advance(ExecutionMode::OneShot, &identity(), &workload, &mut status, &compute, &metrics, Utc::now()).await;
        assert_eq!(status.phase, WorkloadPhase::Running);

        advance(ExecutionMode::OneShot, &identity(), &workload, &mut status, &compute, &metrics, Utc::now()).await;
        assert_eq!(status.phase, WorkloadPhase::Succeeded);
    }

    #[tokio::test]
    async fn exceeding_the_timeout_forces_failed_and_tears_down() {
        let compute = ScriptedCompute::default();
        compute
            .poll_results
            .lock()
            .unwrap()
            .push_back(Ok(remote(&[(RemotePhase::Running, false)])));
        let metrics = Metrics::default();
        let mut status = WorkloadStatus {
            phase: WorkloadPhase::Running,
            handle: Some(handle()),
            replicas: plan_replicas(1),
            started_at: Some(Utc::now() - chrono::Duration::seconds(600)),
            ..Default::default()
        };

        let outcome = advance(
            ExecutionMode::OneShot,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;

        assert_eq!(outcome, StepOutcome::Idle);
        assert_eq!(status.phase, WorkloadPhase::Failed);
        assert_eq!(compute.destroy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_units_never_self_terminate() {
        let compute = ScriptedCompute::default();
        let mut succeeded = remote(&[(RemotePhase::Succeeded, false)]);
        succeeded.url = Some("https://svc.example.run".to_owned());
        compute.poll_results.lock().unwrap().push_back(Ok(succeeded));
        let metrics = Metrics::default();
        let mut status = WorkloadStatus {
            phase: WorkloadPhase::Running,
            handle: Some(handle()),
            replicas: plan_replicas(1),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let outcome = advance(
            ExecutionMode::Persistent,
            &identity(),
            &workload(1),
            &mut status,
            &compute,
            &metrics,
            Utc::now(),
        )
        .await;

        assert_eq!(
            outcome,
            StepOutcome::Requeue(Duration::from_secs(POLL_REQUEUE_SECS))
        );
        assert_eq!(status.phase, WorkloadPhase::Running);
    }

    #[tokio::test]
    async fn cleanup_without_a_unit_skips_teardown() {
        let compute = ScriptedCompute::default();
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();

        let outcome = cleanup(&identity(), &mut status, &compute, &metrics, 5, Utc::now()).await;

        assert_eq!(outcome, CleanupOutcome::Finished);
        assert_eq!(compute.destroy_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleanup_recovers_unpersisted_units_through_the_key() {
        let compute = ScriptedCompute::default();
        *compute.lookup_result.lock().unwrap() = Some(handle());
        let metrics = Metrics::default();
        let mut status = WorkloadStatus::default();

        let outcome = cleanup(&identity(), &mut status, &compute, &metrics, 5, Utc::now()).await;

        assert_eq!(outcome, CleanupOutcome::Finished);
        assert_eq!(compute.destroy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_teardown_blocks_and_counts_attempts() {
        let compute = ScriptedCompute::default();
        compute
            .destroy_results
            .lock()
            .unwrap()
            .push_back(Err(ComputeError::Teardown("api down".into())));
        let metrics = Metrics::default();
        let mut status = WorkloadStatus {
            handle: Some(handle()),
            ..Default::default()
        };

        let outcome = cleanup(&identity(), &mut status, &compute, &metrics, 5, Utc::now()).await;

        assert_eq!(
            outcome,
            CleanupOutcome::Blocked {
                attempts: 1,
                retry_in: Duration::from_secs(2)
            }
        );
        assert_eq!(status.phase, WorkloadPhase::Terminating);
        assert_eq!(status.teardown_attempts, 1);
        assert!(status.handle.is_some());
    }
}
