use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use k8s_offload_core::{
    backoff::REMOTE_CALL_BACKOFF,
    helpers::RequireMetadata,
    resources::crd::v1alpha1::{job::RemoteJob, WorkloadPhase, WorkloadStatus},
    workload::WorkloadSpec,
};
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent},
        watcher, Controller,
    },
    CustomResourceExt,
};
use log::{info, warn};

use crate::helpers::handle_reconciliation_result;

use super::{
    apply_workload_status, context::ReconcilerContext, error::ReconcilerError, identity_of,
    steps::{self, CleanupOutcome, ExecutionMode, StepOutcome},
};

const ERROR_REQUEUE_SECS: u64 = 10;

pub async fn start_job_controller(context: Arc<ReconcilerContext>) {
    info!("Creating remote job controller...");

    Controller::new(context.global_api::<RemoteJob>(), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_job, reconcile_job_error, context)
        .for_each(handle_reconciliation_result)
        .await
}

pub async fn reconcile_job(
    object: Arc<RemoteJob>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, FinalizerError<ReconcilerError>> {
    let namespace = object
        .require_namespace_or(ReconcilerError::MissingObjectMetadata)
        .map_err(FinalizerError::ApplyFailed)?
        .to_owned();
    let api = context.namespaced_api::<RemoteJob>(&namespace);
    let finalizer_name = format!("{}/cleanup", RemoteJob::crd_name());

    finalizer(&api, &finalizer_name, object, |event| async {
        match event {
            FinalizerEvent::Apply(job) => apply(&job, &context).await,
            FinalizerEvent::Cleanup(job) => cleanup(&job, &context).await,
        }
    })
    .await
}

pub fn reconcile_job_error(
    _object: Arc<RemoteJob>,
    error: &FinalizerError<ReconcilerError>,
    _context: Arc<ReconcilerContext>,
) -> Action {
    Action::requeue(match error {
        FinalizerError::CleanupFailed(ReconcilerError::TeardownFailed { attempts }) => {
            REMOTE_CALL_BACKOFF.delay(attempts.saturating_sub(1))
        }
        _ => Duration::from_secs(ERROR_REQUEUE_SECS),
    })
}

async fn apply(object: &RemoteJob, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let identity = identity_of(object)?;
    let mut status = object.status.clone().unwrap_or_default();

    let workload = match WorkloadSpec::from_job(&object.spec) {
        Ok(workload) => workload,
        Err(error) => {
            status.transition(WorkloadPhase::Failed, error.to_string(), Utc::now());
            apply_workload_status::<RemoteJob>(context, &identity, status).await?;

            return Ok(Action::await_change());
        }
    };

    let outcome = steps::advance(
        ExecutionMode::OneShot,
        &identity,
        &workload,
        &mut status,
        context.compute.as_ref(),
        &context.metrics,
        Utc::now(),
    )
    .await;

    manage_tunnel(object, context, &identity.uid, &workload, &status).await;

    apply_workload_status::<RemoteJob>(context, &identity, status).await?;

    Ok(match outcome {
        StepOutcome::Requeue(delay) => Action::requeue(delay),
        StepOutcome::Idle => Action::await_change(),
    })
}

async fn cleanup(
    object: &RemoteJob,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let identity = identity_of(object)?;
    let mut status = object.status.clone().unwrap_or_default();

    context.tunnels.remove(&identity.uid);

    match steps::cleanup(
        &identity,
        &mut status,
        context.compute.as_ref(),
        &context.metrics,
        context.config.teardown_alert_threshold,
        Utc::now(),
    )
    .await
    {
        CleanupOutcome::Finished => Ok(Action::await_change()),
        CleanupOutcome::Blocked { attempts, .. } => {
            let _ = apply_workload_status::<RemoteJob>(context, &identity, status).await;

            Err(ReconcilerError::TeardownFailed { attempts })
        }
    }
}

async fn manage_tunnel(
    object: &RemoteJob,
    context: &ReconcilerContext,
    uid: &str,
    workload: &WorkloadSpec,
    status: &WorkloadStatus,
) {
    if status.phase.is_terminal() {
        context.tunnels.remove(uid);
        return;
    }

    let (Some(tunnel), Some(handle)) = (&workload.tunnel, &status.handle) else {
        return;
    };
    let Some(url) = &handle.tunnel_url else {
        return;
    };

    if status.phase == WorkloadPhase::Running {
        if let Err(error) = context.tunnels.ensure(uid, tunnel.port, url).await {
            warn!(
                "Couldn't open the tunnel bridge for '{}'! {error:?}",
                object.metadata.name.as_deref().unwrap_or("---")
            );
        }
    }
}
