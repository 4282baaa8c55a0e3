use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use k8s_offload_core::{
    backoff::REMOTE_CALL_BACKOFF,
    helpers::RequireMetadata,
    kubernetes::operations::apply_resource,
    resources::{
        crd::v1alpha1::{endpoint::RemoteEndpoint, WorkloadPhase, WorkloadStatus},
        service::generate_endpoint_service,
    },
    workload::WorkloadSpec,
};
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::PatchParams,
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
    OPERATOR_FIELD_MANAGER,
};

const ERROR_REQUEUE_SECS: u64 = 10;

pub async fn start_endpoint_controller(context: Arc<ReconcilerContext>) {
    info!("Creating remote endpoint controller...");

    Controller::new(
        context.global_api::<RemoteEndpoint>(),
        watcher::Config::default(),
    )
    .owns(context.global_api::<Service>(), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile_endpoint, reconcile_endpoint_error, context)
    .for_each(handle_reconciliation_result)
    .await
}

pub async fn reconcile_endpoint(
    object: Arc<RemoteEndpoint>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, FinalizerError<ReconcilerError>> {
    let namespace = object
        .require_namespace_or(ReconcilerError::MissingObjectMetadata)
        .map_err(FinalizerError::ApplyFailed)?
        .to_owned();
    let api = context.namespaced_api::<RemoteEndpoint>(&namespace);
    let finalizer_name = format!("{}/cleanup", RemoteEndpoint::crd_name());

    finalizer(&api, &finalizer_name, object, |event| async {
        match event {
            FinalizerEvent::Apply(endpoint) => apply(&endpoint, &context).await,
            FinalizerEvent::Cleanup(endpoint) => cleanup(&endpoint, &context).await,
        }
    })
    .await
}

pub fn reconcile_endpoint_error(
    _object: Arc<RemoteEndpoint>,
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

async fn apply(
    object: &RemoteEndpoint,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let identity = identity_of(object)?;
    let mut status = object.status.clone().unwrap_or_default();

    let workload = match WorkloadSpec::from_endpoint(&object.spec) {
        Ok(workload) => workload,
        Err(error) => {
            status.transition(WorkloadPhase::Failed, error.to_string(), Utc::now());
            apply_workload_status::<RemoteEndpoint>(context, &identity, status).await?;

            return Ok(Action::await_change());
        }
    };

    let outcome = steps::advance(
        ExecutionMode::Persistent,
        &identity,
        &workload,
        &mut status,
        context.compute.as_ref(),
        &context.metrics,
        Utc::now(),
    )
    .await;

    ensure_service(object, context, &status).await;

    apply_workload_status::<RemoteEndpoint>(context, &identity, status).await?;

    Ok(match outcome {
        StepOutcome::Requeue(delay) => Action::requeue(delay),
        StepOutcome::Idle => Action::await_change(),
    })
}

async fn cleanup(
    object: &RemoteEndpoint,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let identity = identity_of(object)?;
    let mut status = object.status.clone().unwrap_or_default();

    // the owner reference lets garbage collection take the Service down

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
            let _ = apply_workload_status::<RemoteEndpoint>(context, &identity, status).await;

            Err(ReconcilerError::TeardownFailed { attempts })
        }
    }
}

/// Keeps an `ExternalName` Service resolving the endpoint's in-cluster name
/// to the stable URL's host.
async fn ensure_service(
    object: &RemoteEndpoint,
    context: &ReconcilerContext,
    status: &WorkloadStatus,
) {
    let Some(url) = status
        .handle
        .as_ref()
        .and_then(|handle| handle.endpoint_url.as_deref())
    else {
        return;
    };

    let service = match generate_endpoint_service(object, url) {
        Ok(service) => service,
        Err(error) => {
            warn!("Couldn't generate the endpoint service! {error:?}");
            return;
        }
    };

    let (Some(name), Some(namespace)) = (
        service.metadata.name.as_deref(),
        service.metadata.namespace.as_deref(),
    ) else {
        return;
    };

    if let Err(error) = apply_resource(
        &context.client,
        &service,
        name,
        namespace,
        &PatchParams::apply(OPERATOR_FIELD_MANAGER),
    )
    .await
    {
        warn!("Couldn't apply the endpoint service '{name}'! {error:?}");
    }
}
