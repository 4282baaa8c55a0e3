use std::{fmt::Debug, sync::Arc};

use k8s_offload_core::{
    helpers::RequireMetadata,
    kubernetes::operations::apply_resource_status,
    resources::crd::v1alpha1::WorkloadStatus,
};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::PatchParams, core::object::HasStatus, Resource};
use serde::{de::DeserializeOwned, Serialize};
use tokio::join;

use self::{
    context::ReconcilerContext,
    endpoint::start_endpoint_controller,
    error::ReconcilerError,
    function::start_function_controller,
    job::start_job_controller,
    pod::start_pod_controller,
    steps::ResourceIdentity,
};

pub mod context;
pub mod endpoint;
pub mod error;
pub mod function;
pub mod job;
pub mod pod;
pub mod steps;

pub const OPERATOR_FIELD_MANAGER: &str = "k8s-offload-operator";

pub async fn main_operator(context: Arc<ReconcilerContext>) {
    join!(
        start_job_controller(context.clone()),
        start_endpoint_controller(context.clone()),
        start_function_controller(context.clone()),
        start_pod_controller(context),
    );
}

pub(crate) fn identity_of<T: Resource>(object: &T) -> Result<ResourceIdentity, ReconcilerError> {
    Ok(ResourceIdentity {
        namespace: object
            .require_namespace_or(ReconcilerError::MissingObjectMetadata)?
            .to_owned(),
        name: object
            .require_name_or(ReconcilerError::MissingObjectMetadata)?
            .to_owned(),
        uid: object
            .require_uid_or(ReconcilerError::MissingObjectMetadata)?
            .to_owned(),
    })
}

pub(crate) async fn apply_workload_status<T>(
    context: &ReconcilerContext,
    identity: &ResourceIdentity,
    status: WorkloadStatus,
) -> Result<(), ReconcilerError>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + HasStatus<Status = WorkloadStatus>
        + Default
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    apply_resource_status::<T, WorkloadStatus>(
        &context.client,
        status,
        &identity.name,
        &identity.namespace,
        &PatchParams::apply(OPERATOR_FIELD_MANAGER),
    )
    .await
    .map_err(ReconcilerError::KubeApiError)
}
