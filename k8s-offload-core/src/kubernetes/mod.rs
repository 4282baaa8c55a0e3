use k8s_openapi::NamespaceResourceScope;
use kube::{core::object::HasStatus, Api, Client, Resource};
use serde::de::DeserializeOwned;

pub mod operations;

pub trait FromStatus<S> {
    fn from_status(status: S) -> Self;
}

impl<T: Default + HasStatus<Status = S>, S> FromStatus<S> for T {
    fn from_status(status: S) -> Self {
        let mut object = Self::default();

        *object.status_mut() = Some(status);

        object
    }
}

pub trait GetApi {
    fn namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + DeserializeOwned;

    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()> + DeserializeOwned;
}

impl GetApi for Client {
    fn namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + DeserializeOwned,
    {
        Api::namespaced(self.clone(), namespace)
    }

    fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()> + DeserializeOwned,
    {
        Api::all(self.clone())
    }
}
