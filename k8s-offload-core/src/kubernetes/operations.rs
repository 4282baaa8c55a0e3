use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    core::object::HasStatus,
    Api, Client, Resource,
};
use log::info;
use serde::{de::DeserializeOwned, Serialize};

use crate::helpers::pretty_type_name;

use super::{FromStatus, GetApi};

/// Server-side applies a namespaced resource.
pub async fn apply_resource<T>(
    client: &Client,
    resource: &T,
    name: &str,
    namespace: &str,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    info!(
        "Applying '{name}' {} resource on the cluster...",
        pretty_type_name::<T>()
    );

    client
        .namespaced_api(namespace)
        .patch(name, patch_params, &Patch::Apply(resource))
        .await
}

/// Server-side applies only the status subresource, leaving the object's
/// spec to its owner.
pub async fn apply_resource_status<T, S>(
    client: &Client,
    status: S,
    name: &str,
    namespace: &str,
    patch_params: &PatchParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + HasStatus<Status = S>
        + Default
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let object = T::from_status(status);
    let api: Api<T> = client.namespaced_api(namespace);

    api.patch_status(name, patch_params, &Patch::Apply(&object))
        .await?;

    Ok(())
}

/// Fetches a resource, mapping a 404 to None.
pub async fn try_get_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<T> = client.namespaced_api(namespace);

    api.get_opt(name).await
}

/// Deletes a resource, treating a 404 as already removed.
pub async fn try_remove_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    delete_params: &DeleteParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let api: Api<T> = client.namespaced_api(namespace);

    match api.delete(name, delete_params).await {
        Ok(_) => {
            info!(
                "Removed '{name}' {} resource from the cluster...",
                pretty_type_name::<T>()
            );
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}
