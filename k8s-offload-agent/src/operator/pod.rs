use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::StreamExt;
use k8s_offload_core::{
    kubernetes::operations::{apply_resource, try_get_resource},
    resources::{
        annotations::{parse_directives, recall_containers, OffloadDirectives, RecordedContainer, WorkloadKind},
        crd::v1alpha1::{endpoint::RemoteEndpoint, job::RemoteJob, WorkloadStatus},
        labels::{get_companion_labels, get_intercepted_pod_watcher_config},
    },
    status::mapper::synthesize_pod_status,
    workload::{endpoint_spec_from_pod, job_spec_from_pod},
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Patch, PatchParams},
    core::ObjectMeta,
    runtime::{controller::Action, Controller},
    Resource,
};
use log::{info, warn};
use serde_json::json;

use crate::{helpers::handle_reconciliation_result, metrics::Metrics};

use super::{
    context::ReconcilerContext, error::ReconcilerError, identity_of, steps::ResourceIdentity,
    OPERATOR_FIELD_MANAGER,
};

/// Matches the interval at which the remote side refreshes unit status.
const STATUS_SYNC_SECS: u64 = 30;

pub async fn start_pod_controller(context: Arc<ReconcilerContext>) {
    info!("Creating intercepted pod controller...");

    Controller::new(
        context.global_api::<Pod>(),
        get_intercepted_pod_watcher_config(),
    )
    .shutdown_on_signal()
    .run(reconcile_pod, reconcile_pod_error, context)
    .for_each(handle_reconciliation_result)
    .await
}

/// Creates the companion resource for a mutated pod exactly once, then
/// keeps mapping the companion's status back onto the pod so kubectl shows
/// the remote execution as a native one.
pub async fn reconcile_pod(
    object: Arc<Pod>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let identity = identity_of(object.as_ref())?;
    let empty = Default::default();
    let annotations = object.metadata.annotations.as_ref().unwrap_or(&empty);

    let directives = match parse_directives(annotations) {
        Ok(directives) => directives,
        Err(error) => return Ok(skip_malformed(&identity, &context.metrics, &error.to_string())),
    };
    let containers = match recall_containers(annotations) {
        Ok(containers) => containers,
        Err(error) => return Ok(skip_malformed(&identity, &context.metrics, &error.to_string())),
    };

    let status = match directives.kind {
        WorkloadKind::Job => {
            sync_job_companion(&object, &context, &identity, &directives, &containers).await?
        }
        WorkloadKind::Endpoint => {
            sync_endpoint_companion(&object, &context, &identity, &directives, &containers).await?
        }
    };

    if let Some(status) = status {
        sync_pod_status(&object, &context, &identity, &status).await?;
    }

    Ok(Action::requeue(Duration::from_secs(STATUS_SYNC_SECS)))
}

pub fn reconcile_pod_error(
    _object: Arc<Pod>,
    _error: &ReconcilerError,
    _context: Arc<ReconcilerContext>,
) -> Action {
    Action::requeue(Duration::from_secs(10))
}

fn skip_malformed(identity: &ResourceIdentity, metrics: &Metrics, message: &str) -> Action {
    warn!(
        "Pod '{}/{}' carries malformed offload annotations, leaving it alone! {message}",
        identity.namespace, identity.name
    );

    Metrics::increment(&metrics.admission_errors);

    Action::await_change()
}

fn companion_name(identity: &ResourceIdentity) -> String {
    format!("{}-remote", identity.name)
}

fn companion_metadata(pod: &Pod, identity: &ResourceIdentity) -> ObjectMeta {
    ObjectMeta {
        name: Some(companion_name(identity)),
        namespace: Some(identity.namespace.clone()),
        labels: Some(get_companion_labels(&identity.name)),
        owner_references: pod.controller_owner_ref(&()).map(|owner| vec![owner]),
        ..Default::default()
    }
}

async fn sync_job_companion(
    pod: &Pod,
    context: &ReconcilerContext,
    identity: &ResourceIdentity,
    directives: &OffloadDirectives,
    containers: &[RecordedContainer],
) -> Result<Option<WorkloadStatus>, ReconcilerError> {
    let name = companion_name(identity);
    let existing: Option<RemoteJob> = try_get_resource(&context.client, &name, &identity.namespace)
        .await
        .map_err(ReconcilerError::KubeApiError)?;

    let job = match existing {
        Some(job) => job,
        None => {
            let spec = job_spec_from_pod(containers, directives)
                .map_err(ReconcilerError::ValidationError)?;
            let job = RemoteJob {
                metadata: companion_metadata(pod, identity),
                spec,
                status: None,
            };

            info!(
                "Creating companion job '{name}' for pod '{}/{}'",
                identity.namespace, identity.name
            );

            apply_resource(
                &context.client,
                &job,
                &name,
                &identity.namespace,
                &PatchParams::apply(OPERATOR_FIELD_MANAGER),
            )
            .await
            .map_err(ReconcilerError::KubeApiError)?
        }
    };

    Ok(job.status)
}

async fn sync_endpoint_companion(
    pod: &Pod,
    context: &ReconcilerContext,
    identity: &ResourceIdentity,
    directives: &OffloadDirectives,
    containers: &[RecordedContainer],
) -> Result<Option<WorkloadStatus>, ReconcilerError> {
    let name = companion_name(identity);
    let existing: Option<RemoteEndpoint> =
        try_get_resource(&context.client, &name, &identity.namespace)
            .await
            .map_err(ReconcilerError::KubeApiError)?;

    let endpoint = match existing {
        Some(endpoint) => endpoint,
        None => {
            let spec = endpoint_spec_from_pod(containers, directives)
                .map_err(ReconcilerError::ValidationError)?;
            let endpoint = RemoteEndpoint {
                metadata: companion_metadata(pod, identity),
                spec,
                status: None,
            };

            info!(
                "Creating companion endpoint '{name}' for pod '{}/{}'",
                identity.namespace, identity.name
            );

            apply_resource(
                &context.client,
                &endpoint,
                &name,
                &identity.namespace,
                &PatchParams::apply(OPERATOR_FIELD_MANAGER),
            )
            .await
            .map_err(ReconcilerError::KubeApiError)?
        }
    };

    Ok(endpoint.status)
}

async fn sync_pod_status(
    pod: &Pod,
    context: &ReconcilerContext,
    identity: &ResourceIdentity,
    status: &WorkloadStatus,
) -> Result<(), ReconcilerError> {
    let Some(handle) = &status.handle else {
        return Ok(());
    };

    let pod_status = synthesize_pod_status(pod, handle, status.phase, Utc::now());
    let api = context.namespaced_api::<Pod>(&identity.namespace);

    // merge instead of apply, the kubelet owns most of the pod status
    api.patch_status(
        &identity.name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": pod_status })),
    )
    .await
    .map_err(ReconcilerError::KubeApiError)?;

    Ok(())
}
