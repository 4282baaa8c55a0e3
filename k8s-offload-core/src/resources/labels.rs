use std::collections::BTreeMap;

use kube::runtime::watcher;

/// Set on pods the webhook mutated; the pod controller only watches these.
pub const INTERCEPTED_LABEL: &str = "k8s-offload.dev/intercepted";
/// Set on companion resources, carries the originating pod's name.
pub const ORIGINAL_POD_LABEL: &str = "k8s-offload.dev/pod";

pub fn get_intercepted_pod_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(INTERCEPTED_LABEL.to_owned(), "true".to_owned())])
}

pub fn get_companion_labels(pod_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_owned(), "k8s-offload-operator".to_owned()),
        (ORIGINAL_POD_LABEL.to_owned(), pod_name.to_owned()),
    ])
}

pub fn get_intercepted_pod_watcher_config() -> watcher::Config {
    watcher::Config::default().labels(&format!("{INTERCEPTED_LABEL}=true"))
}
