use std::fmt::Debug;

use k8s_offload_core::helpers::pretty_type_name;
use kube::{
    runtime::{
        controller::{Action, Error as ControllerError},
        reflector::ObjectRef,
        watcher::Error as WatcherError,
    },
    Resource,
};
use log::{error, info, warn};

pub fn handle_reconciliation_result<T, E>(
    result: Result<(ObjectRef<T>, Action), ControllerError<E, WatcherError>>,
) -> impl std::future::Future<Output = ()>
where
    T: Resource,
    E: Debug,
{
    let resource_name = pretty_type_name::<T>();

    match result {
        Ok((object, action)) => info!(
            "{} '{}/{}' reconciled, next action: {:?}",
            resource_name,
            object.namespace.as_deref().unwrap_or("---"),
            object.name,
            action
        ),
        Err(err) => match err {
            ControllerError::ObjectNotFound(_) => (), // deleted while queued
            ControllerError::ReconcilerFailed(error, object) => {
                warn!(
                    "Reconciliation of {} '{}/{}' failed! {:#?}",
                    resource_name.to_lowercase(),
                    object.namespace.as_deref().unwrap_or("---"),
                    object.name,
                    error
                )
            }
            ControllerError::QueueError(watcher_err) => {
                error!("The watcher has failed! {watcher_err:#?}")
            }
        },
    }

    std::future::ready(())
}
