use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_offload_core::{
    remote::{RemoteExecutionHandle, RemotePhase, RemoteReplicaStatus, RemoteStatus},
    workload::WorkloadSpec,
};
use log::info;

use super::{ComputeError, ComputeService};

const MOCK_COMPLETION_SECS: i64 = 30;

struct MockUnit {
    handle: RemoteExecutionHandle,
    replicas: u32,
    persistent: bool,
    created_at: DateTime<Utc>,
}

/// In-process stand-in for the compute service, for development clusters
/// with no service account. Units run for a fixed interval, then one-shot
/// units succeed while persistent ones keep running.
#[derive(Default)]
pub struct MockComputeService {
    units: Mutex<HashMap<String, MockUnit>>,
}

impl MockComputeService {
    fn get_or_insert(
        &self,
        key: &str,
        workload: &WorkloadSpec,
        persistent: bool,
    ) -> RemoteExecutionHandle {
        let mut units = self.units.lock().unwrap();

        if let Some(unit) = units.get(key) {
            return unit.handle.clone();
        }

        let sequence = units.len();
        let handle = RemoteExecutionHandle {
            app_id: format!("mock-ap-{sequence}"),
            function_ids: (0..workload.replicas)
                .map(|rank| format!("mock-fn-{sequence}-{rank}"))
                .collect(),
            tunnel_url: None,
            endpoint_url: persistent.then(|| format!("https://mock-{sequence}.offload.invalid")),
        };

        info!("Mock unit '{}' created for key '{key}'", handle.app_id);

        units.insert(
            key.to_owned(),
            MockUnit {
                handle: handle.clone(),
                replicas: workload.replicas,
                persistent,
                created_at: Utc::now(),
            },
        );

        handle
    }
}

#[async_trait]
impl ComputeService for MockComputeService {
    async fn create(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError> {
        Ok(self.get_or_insert(key, workload, false))
    }

    async fn deploy_persistent(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError> {
        Ok(self.get_or_insert(key, workload, true))
    }

    async fn lookup(&self, key: &str) -> Result<Option<RemoteExecutionHandle>, ComputeError> {
        let units = self.units.lock().unwrap();

        Ok(units.get(key).map(|unit| unit.handle.clone()))
    }

    async fn poll(&self, handle: &RemoteExecutionHandle) -> Result<RemoteStatus, ComputeError> {
        let units = self.units.lock().unwrap();
        let unit = units
            .values()
            .find(|unit| unit.handle.app_id == handle.app_id)
            .ok_or_else(|| ComputeError::Rejected(format!("Unknown unit '{}'!", handle.app_id)))?;

        let now = Utc::now();
        let finished =
            !unit.persistent && now - unit.created_at > Duration::seconds(MOCK_COMPLETION_SECS);
        let phase = match finished {
            true => RemotePhase::Succeeded,
            false => RemotePhase::Running,
        };

        Ok(RemoteStatus {
            accepted: true,
            replicas: (0..unit.replicas)
                .map(|rank| RemoteReplicaStatus {
                    rank,
                    phase,
                    retryable: false,
                    heartbeat: Some(now),
                    message: None,
                })
                .collect(),
            url: unit.handle.endpoint_url.clone(),
        })
    }

    async fn destroy(&self, handle: &RemoteExecutionHandle) -> Result<(), ComputeError> {
        let mut units = self.units.lock().unwrap();

        units.retain(|_, unit| unit.handle.app_id != handle.app_id);

        info!("Mock unit '{}' destroyed", handle.app_id);

        Ok(())
    }

    async fn create_tunnel(
        &self,
        handle: &RemoteExecutionHandle,
        port: u16,
    ) -> Result<String, ComputeError> {
        Ok(format!("mock-{}.tunnel.invalid:{port}", handle.app_id))
    }
}

#[cfg(test)]
mod tests {
    use k8s_offload_core::resources::crd::v1alpha1::job::RemoteJobSpec;
    use k8s_offload_core::workload::WorkloadSpec;

    use super::*;

    fn workload() -> WorkloadSpec {
        WorkloadSpec::from_job(&RemoteJobSpec {
            image: "busybox".to_owned(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent_per_key() {
        let service = MockComputeService::default();

        let first = service.create("default.train.uid-1", &workload()).await.unwrap();
        let second = service.create("default.train.uid-1", &workload()).await.unwrap();
        let other = service.create("default.train.uid-2", &workload()).await.unwrap();

        assert_eq!(first, second);
        assert_ne!(first.app_id, other.app_id);
    }

    #[tokio::test]
    async fn lookup_resolves_created_keys() {
        let service = MockComputeService::default();

        let handle = service.create("default.train.uid-1", &workload()).await.unwrap();

        assert_eq!(
            service.lookup("default.train.uid-1").await.unwrap(),
            Some(handle)
        );
        assert_eq!(service.lookup("default.other.uid-9").await.unwrap(), None);
    }
}
