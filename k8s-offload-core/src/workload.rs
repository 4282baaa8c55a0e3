use std::{collections::BTreeMap, fmt::Display, time::Duration};

use thiserror::Error;

use crate::resources::{
    annotations::{OffloadDirectives, RecordedContainer},
    crd::v1alpha1::{
        endpoint::RemoteEndpointSpec, function::RemoteFunctionSpec, job::RemoteJobSpec,
    },
};

pub const DEFAULT_CPU: f64 = 1.0;
pub const DEFAULT_MEMORY_MB: u32 = 512;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_TUNNEL_PORT: u16 = 8000;
pub const DEFAULT_GPU_TYPE: &str = "T4";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Workload image must not be empty!")]
    MissingImage,
    #[error("Workload handler must not be empty!")]
    MissingHandler,
    #[error("Replica count must be at least 1!")]
    InvalidReplicaCount,
    #[error("'{}' is not a valid CPU allocation!", .0)]
    InvalidCpu(String),
    #[error("'{}' is not a valid memory allocation!", .0)]
    InvalidMemory(String),
    #[error("'{}' is not a valid GPU specification (expected TYPE or TYPE:COUNT)!", .0)]
    InvalidGpu(String),
    #[error("Workload timeout must be greater than zero!")]
    InvalidTimeout,
    #[error("Tunnel port must not be zero!")]
    InvalidTunnelPort,
    #[error("Pod has no containers to offload!")]
    NoContainers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSpec {
    pub gpu_type: String,
    pub count: u32,
}

impl GpuSpec {
    /// Parses the `TYPE` or `TYPE:COUNT` form (e.g. "T4", "A100:2").
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidGpu(raw.to_owned());

        match raw.split_once(':') {
            Some((gpu_type, count)) => {
                if gpu_type.is_empty() {
                    return Err(invalid());
                }

                let count: u32 = count.parse().map_err(|_| invalid())?;
                if count == 0 {
                    return Err(invalid());
                }

                Ok(GpuSpec {
                    gpu_type: gpu_type.to_owned(),
                    count,
                })
            }
            None if !raw.is_empty() => Ok(GpuSpec {
                gpu_type: raw.to_owned(),
                count: 1,
            }),
            None => Err(invalid()),
        }
    }
}

impl Display for GpuSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.gpu_type, self.count)
    }
}

/// Parses a memory allocation ("512Mi", "2Gi", "2G", plain megabytes) to MB.
pub fn parse_memory(raw: &str) -> Result<u32, ValidationError> {
    let invalid = || ValidationError::InvalidMemory(raw.to_owned());
    let parse_number = |digits: &str| digits.parse::<u32>().map_err(|_| invalid());

    if let Some(digits) = raw.strip_suffix("Gi").or_else(|| raw.strip_suffix('G')) {
        return Ok(parse_number(digits)? * 1024);
    }

    if let Some(digits) = raw.strip_suffix("Mi").or_else(|| raw.strip_suffix('M')) {
        return parse_number(digits);
    }

    parse_number(raw)
}

pub fn parse_cpu(raw: &str) -> Result<f64, ValidationError> {
    let cpu: f64 = raw
        .parse()
        .map_err(|_| ValidationError::InvalidCpu(raw.to_owned()))?;

    if cpu <= 0.0 {
        return Err(ValidationError::InvalidCpu(raw.to_owned()));
    }

    Ok(cpu)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub port: u16,
}

/// Validated description of an offloaded workload, produced only by the
/// strict conversions below. Immutable once the owning resource exists.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub cpu: f64,
    pub memory_mb: u32,
    pub gpu: Option<GpuSpec>,
    pub env: BTreeMap<String, String>,
    pub replicas: u32,
    pub enable_networking: bool,
    pub timeout: Duration,
    pub retries: u32,
    pub tunnel: Option<TunnelSpec>,
    pub handler: Option<String>,
    pub concurrency: Option<u32>,
}

impl WorkloadSpec {
    pub fn from_job(spec: &RemoteJobSpec) -> Result<Self, ValidationError> {
        if spec.image.is_empty() {
            return Err(ValidationError::MissingImage);
        }

        let replicas = spec.replicas.unwrap_or(1);
        if replicas == 0 {
            return Err(ValidationError::InvalidReplicaCount);
        }

        let timeout_seconds = u64::from(spec.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS as u32));
        if timeout_seconds == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        let tunnel = match spec.tunnel_enabled.unwrap_or(false) {
            true => {
                let port = spec.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT);
                if port == 0 {
                    return Err(ValidationError::InvalidTunnelPort);
                }

                Some(TunnelSpec { port })
            }
            false => None,
        };

        Ok(WorkloadSpec {
            image: spec.image.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            cpu: parse_optional_cpu(spec.cpu.as_deref())?,
            memory_mb: parse_optional_memory(spec.memory.as_deref())?,
            gpu: spec.gpu.as_deref().map(GpuSpec::parse).transpose()?,
            env: spec.env.clone(),
            replicas,
            enable_networking: spec.enable_networking.unwrap_or(false),
            timeout: Duration::from_secs(timeout_seconds),
            retries: spec.retries.unwrap_or(0),
            tunnel,
            handler: None,
            concurrency: None,
        })
    }

    pub fn from_endpoint(spec: &RemoteEndpointSpec) -> Result<Self, ValidationError> {
        if spec.image.is_empty() {
            return Err(ValidationError::MissingImage);
        }

        if spec.command.is_empty() && spec.handler.as_deref().unwrap_or("").is_empty() {
            return Err(ValidationError::MissingHandler);
        }

        Ok(WorkloadSpec {
            image: spec.image.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            cpu: parse_optional_cpu(spec.cpu.as_deref())?,
            memory_mb: parse_optional_memory(spec.memory.as_deref())?,
            gpu: spec.gpu.as_deref().map(GpuSpec::parse).transpose()?,
            env: spec.env.clone(),
            replicas: 1,
            enable_networking: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: 0,
            tunnel: None,
            handler: spec.handler.clone(),
            concurrency: None,
        })
    }

    pub fn from_function(spec: &RemoteFunctionSpec) -> Result<Self, ValidationError> {
        if spec.image.is_empty() {
            return Err(ValidationError::MissingImage);
        }

        if spec.handler.is_empty() {
            return Err(ValidationError::MissingHandler);
        }

        let timeout_seconds = u64::from(spec.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS as u32));
        if timeout_seconds == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        Ok(WorkloadSpec {
            image: spec.image.clone(),
            command: Vec::new(),
            args: Vec::new(),
            cpu: parse_optional_cpu(spec.cpu.as_deref())?,
            memory_mb: parse_optional_memory(spec.memory.as_deref())?,
            gpu: spec.gpu.as_deref().map(GpuSpec::parse).transpose()?,
            env: spec.env.clone(),
            replicas: 1,
            enable_networking: false,
            timeout: Duration::from_secs(timeout_seconds),
            retries: 0,
            tunnel: None,
            handler: Some(spec.handler.clone()),
            concurrency: spec.concurrency,
        })
    }
}

/// Translates an intercepted pod's recorded containers and directives into
/// the companion RemoteJob spec. The first container is the workload, any
/// further ones are dropped (sidecars make no sense off-cluster).
pub fn job_spec_from_pod(
    containers: &[RecordedContainer],
    directives: &OffloadDirectives,
) -> Result<RemoteJobSpec, ValidationError> {
    let primary = containers.first().ok_or(ValidationError::NoContainers)?;

    let mut env = primary.env.clone();
    env.extend(directives.env.clone());

    let spec = RemoteJobSpec {
        image: directives
            .image_override
            .clone()
            .unwrap_or_else(|| primary.image.clone()),
        command: directives
            .command_override
            .clone()
            .unwrap_or_else(|| primary.command.clone()),
        args: primary.args.clone(),
        cpu: directives.cpu.clone(),
        memory: directives.memory.clone(),
        gpu: pod_gpu(primary, directives),
        env,
        timeout_seconds: directives.timeout_seconds,
        retries: directives.retries,
        replicas: directives.replicas,
        enable_networking: Some(directives.networking),
        tunnel_enabled: Some(directives.tunnel),
        tunnel_port: directives.tunnel_port,
    };

    WorkloadSpec::from_job(&spec)?;

    Ok(spec)
}

pub fn endpoint_spec_from_pod(
    containers: &[RecordedContainer],
    directives: &OffloadDirectives,
) -> Result<RemoteEndpointSpec, ValidationError> {
    let primary = containers.first().ok_or(ValidationError::NoContainers)?;

    let mut env = primary.env.clone();
    env.extend(directives.env.clone());

    let spec = RemoteEndpointSpec {
        image: directives
            .image_override
            .clone()
            .unwrap_or_else(|| primary.image.clone()),
        handler: None,
        command: directives
            .command_override
            .clone()
            .unwrap_or_else(|| primary.command.clone()),
        args: primary.args.clone(),
        cpu: directives.cpu.clone(),
        memory: directives.memory.clone(),
        gpu: pod_gpu(primary, directives),
        env,
    };

    WorkloadSpec::from_endpoint(&spec)?;

    Ok(spec)
}

fn pod_gpu(container: &RecordedContainer, directives: &OffloadDirectives) -> Option<String> {
    match (&directives.gpu, container.gpu_count) {
        (Some(gpu), _) => Some(gpu.clone()),
        (None, 0) => None,
        (None, count) => Some(format!("{DEFAULT_GPU_TYPE}:{count}")),
    }
}

fn parse_optional_cpu(raw: Option<&str>) -> Result<f64, ValidationError> {
    match raw {
        Some(raw) => parse_cpu(raw),
        None => Ok(DEFAULT_CPU),
    }
}

fn parse_optional_memory(raw: Option<&str>) -> Result<u32, ValidationError> {
    match raw {
        Some(raw) => parse_memory(raw),
        None => Ok(DEFAULT_MEMORY_MB),
    }
}

/// Deterministic key identifying a resource towards the external service.
/// A retried create after a crash resolves to the already-created unit
/// through this key instead of creating a duplicate.
pub fn idempotency_key(namespace: &str, name: &str, uid: &str) -> String {
    format!("{namespace}.{name}.{uid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_parsing_accepts_kubernetes_quantities() {
        assert_eq!(parse_memory("512Mi").unwrap(), 512);
        assert_eq!(parse_memory("512M").unwrap(), 512);
        assert_eq!(parse_memory("2Gi").unwrap(), 2048);
        assert_eq!(parse_memory("2G").unwrap(), 2048);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
    }

    #[test]
    fn memory_parsing_rejects_garbage() {
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("Mi").is_err());
        assert!(parse_memory("-5Mi").is_err());
    }

    #[test]
    fn gpu_spec_parses_type_and_count() {
        let gpu = GpuSpec::parse("A100:2").unwrap();
        assert_eq!(gpu.gpu_type, "A100");
        assert_eq!(gpu.count, 2);

        let gpu = GpuSpec::parse("T4").unwrap();
        assert_eq!(gpu.gpu_type, "T4");
        assert_eq!(gpu.count, 1);

        assert!(GpuSpec::parse("").is_err());
        assert!(GpuSpec::parse(":2").is_err());
        assert!(GpuSpec::parse("T4:zero").is_err());
        assert!(GpuSpec::parse("T4:0").is_err());
    }

    #[test]
    fn job_spec_defaults_are_applied() {
        let spec = RemoteJobSpec {
            image: "pytorch/pytorch:latest".to_owned(),
            command: vec!["python".to_owned(), "train.py".to_owned()],
            ..Default::default()
        };

        let workload = WorkloadSpec::from_job(&spec).unwrap();

        assert_eq!(workload.cpu, DEFAULT_CPU);
        assert_eq!(workload.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(workload.replicas, 1);
        assert_eq!(workload.timeout.as_secs(), DEFAULT_TIMEOUT_SECS);
        assert!(workload.tunnel.is_none());
        assert!(!workload.enable_networking);
    }

    #[test]
    fn job_spec_with_empty_image_is_rejected() {
        let spec = RemoteJobSpec::default();

        assert!(matches!(
            WorkloadSpec::from_job(&spec),
            Err(ValidationError::MissingImage)
        ));
    }

    #[test]
    fn job_spec_with_zero_replicas_is_rejected() {
        let spec = RemoteJobSpec {
            image: "busybox".to_owned(),
            replicas: Some(0),
            ..Default::default()
        };

        assert!(matches!(
            WorkloadSpec::from_job(&spec),
            Err(ValidationError::InvalidReplicaCount)
        ));
    }

    #[test]
    fn function_spec_requires_handler() {
        let spec = RemoteFunctionSpec {
            image: "python:3.11-slim".to_owned(),
            ..Default::default()
        };

        assert!(matches!(
            WorkloadSpec::from_function(&spec),
            Err(ValidationError::MissingHandler)
        ));
    }

    #[test]
    fn pod_translation_prefers_directive_overrides() {
        let containers = vec![RecordedContainer {
            name: "trainer".to_owned(),
            image: "pytorch/pytorch:latest".to_owned(),
            command: vec!["python".to_owned()],
            args: vec!["train.py".to_owned()],
            env: BTreeMap::from([("EPOCHS".to_owned(), "10".to_owned())]),
            gpu_count: 2,
        }];
        let directives = OffloadDirectives {
            requested: true,
            image_override: Some("pytorch/pytorch:2.0".to_owned()),
            env: BTreeMap::from([("EPOCHS".to_owned(), "20".to_owned())]),
            ..Default::default()
        };

        let spec = job_spec_from_pod(&containers, &directives).unwrap();

        assert_eq!(spec.image, "pytorch/pytorch:2.0");
        assert_eq!(spec.args, vec!["train.py"]);
        assert_eq!(spec.env["EPOCHS"], "20");
        assert_eq!(spec.gpu.as_deref(), Some("T4:2"));
    }

    #[test]
    fn pod_translation_requires_a_container() {
        let directives = OffloadDirectives::default();

        assert!(matches!(
            job_spec_from_pod(&[], &directives),
            Err(ValidationError::NoContainers)
        ));
    }

    #[test]
    fn idempotency_key_is_stable_per_identity() {
        let first = idempotency_key("default", "train", "abc-123");
        let second = idempotency_key("default", "train", "abc-123");
        let other = idempotency_key("default", "train", "def-456");

        assert_eq!(first, second);
        assert_ne!(first, other);
    }
}
