use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::{
    compute::ComputeService, config::OperatorConfig, metrics::Metrics, tunnel::TunnelRegistry,
};

pub struct ReconcilerContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub compute: Arc<dyn ComputeService>,
    pub tunnels: TunnelRegistry,
    pub metrics: Arc<Metrics>,
}

impl ReconcilerContext {
    pub fn namespaced_api<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + DeserializeOwned,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn default_namespaced_api<T>(&self) -> Api<T>
    where
        T: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + DeserializeOwned,
    {
        Api::default_namespaced(self.client.clone())
    }

    pub fn global_api<T>(&self) -> Api<T>
    where
        T: Resource<DynamicType = ()> + DeserializeOwned,
    {
        Api::all(self.client.clone())
    }
}
