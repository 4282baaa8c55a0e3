use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use k8s_offload_core::{
    remote::{RemoteExecutionHandle, RemoteStatus},
    status::coordinator::shared_env,
    workload::WorkloadSpec,
};
use reqwest::{header, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;

use crate::config::OperatorConfig;

use super::{ComputeError, ComputeService};

/// HTTP client for the compute service API. Every call runs under the
/// configured caller-side deadline; exceeding it is a transient error.
pub struct HttpComputeService {
    base_url: String,
    deadline: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateUnitRequest<'a> {
    idempotency_key: &'a str,
    image: &'a str,
    command: &'a [String],
    args: &'a [String],
    cpu: f64,
    memory_mb: u32,
    gpu: Option<String>,
    env: BTreeMap<String, String>,
    replicas: u32,
    enable_networking: bool,
    timeout_seconds: u64,
    retries: u32,
    handler: Option<&'a str>,
    concurrency: Option<u32>,
}

impl<'a> CreateUnitRequest<'a> {
    fn from_workload(key: &'a str, workload: &'a WorkloadSpec) -> Self {
        // the cluster-shape variables win over user-provided ones
        let mut env = workload.env.clone();
        env.extend(shared_env(workload.replicas, workload.enable_networking));

        Self {
            idempotency_key: key,
            image: &workload.image,
            command: &workload.command,
            args: &workload.args,
            cpu: workload.cpu,
            memory_mb: workload.memory_mb,
            gpu: workload.gpu.as_ref().map(|gpu| gpu.to_string()),
            env,
            replicas: workload.replicas,
            enable_networking: workload.enable_networking,
            timeout_seconds: workload.timeout.as_secs(),
            retries: workload.retries,
            handler: workload.handler.as_deref(),
            concurrency: workload.concurrency,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelResponse {
    url: String,
}

impl HttpComputeService {
    pub fn new(config: &OperatorConfig) -> Result<Self, ComputeError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = &config.service_token {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ComputeError::Rejected("The service token is malformed!".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|error| ComputeError::Transient(error.to_string()))?;

        Ok(Self {
            base_url: config.service_url.trim_end_matches('/').to_owned(),
            deadline: config.remote_deadline,
            client,
        })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ComputeError> {
        let request = self.client.post(format!("{}{path}", self.base_url)).json(body);
        let response = self.dispatch(request.send()).await?;

        read_json(check_status(response)?).await
    }

    async fn dispatch(
        &self,
        request: impl std::future::Future<Output = Result<Response, reqwest::Error>>,
    ) -> Result<Response, ComputeError> {
        match timeout(self.deadline, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(ComputeError::Transient(error.to_string())),
            Err(_) => Err(ComputeError::Transient(format!(
                "The call exceeded the {}s deadline!",
                self.deadline.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ComputeService for HttpComputeService {
    async fn create(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError> {
        self.post_json("/v1/units", &CreateUnitRequest::from_workload(key, workload))
            .await
    }

    async fn deploy_persistent(
        &self,
        key: &str,
        workload: &WorkloadSpec,
    ) -> Result<RemoteExecutionHandle, ComputeError> {
        self.post_json(
            "/v1/deployments",
            &CreateUnitRequest::from_workload(key, workload),
        )
        .await
    }

    async fn lookup(&self, key: &str) -> Result<Option<RemoteExecutionHandle>, ComputeError> {
        let request = self.client.get(format!("{}/v1/units/by-key/{key}", self.base_url));
        let response = self.dispatch(request.send()).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        Ok(Some(read_json(check_status(response)?).await?))
    }

    async fn poll(&self, handle: &RemoteExecutionHandle) -> Result<RemoteStatus, ComputeError> {
        let request = self
            .client
            .get(format!("{}/v1/units/{}/status", self.base_url, handle.app_id));
        let response = self.dispatch(request.send()).await?;

        read_json(check_status(response)?).await
    }

    async fn destroy(&self, handle: &RemoteExecutionHandle) -> Result<(), ComputeError> {
        let request = self
            .client
            .delete(format!("{}/v1/units/{}", self.base_url, handle.app_id));
        let response = self.dispatch(request.send()).await?;

        if response.status() == StatusCode::NOT_FOUND {
            // already gone, the teardown is confirmed
            return Ok(());
        }

        match check_status(response) {
            Ok(_) => Ok(()),
            Err(error) => Err(ComputeError::Teardown(error.to_string())),
        }
    }

    async fn create_tunnel(
        &self,
        handle: &RemoteExecutionHandle,
        port: u16,
    ) -> Result<String, ComputeError> {
        let response: TunnelResponse = self
            .post_json(
                &format!("/v1/units/{}/tunnels", handle.app_id),
                &json!({ "port": port }),
            )
            .await?;

        Ok(response.url)
    }
}

fn check_status(response: Response) -> Result<Response, ComputeError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let message = format!("The service responded with status {status}!");

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Err(ComputeError::Transient(message))
        }
        status if status.is_server_error() => Err(ComputeError::Transient(message)),
        _ => Err(ComputeError::Rejected(message)),
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ComputeError> {
    response
        .json()
        .await
        .map_err(|error| ComputeError::Transient(error.to_string()))
}
