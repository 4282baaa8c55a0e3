pub mod backoff;
pub mod helpers;
pub mod kubernetes;
pub mod remote;
pub mod resources;
pub mod status;
pub mod workload;

pub const RESOURCE_GROUP: &str = "k8s-offload.dev";

/// Host reported for pod-visible statuses of workloads that run remotely.
pub const REMOTE_HOST_SENTINEL: &str = "remote.k8s-offload.dev";

pub const OPERATOR_CLUSTERROLE_NAME: &str = "k8s-offload-operator";
