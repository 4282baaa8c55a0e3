use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RESOURCE_GROUP;

pub const OFFLOAD_ANNOTATION: &str = "k8s-offload.dev/offload";
pub const OPT_OUT_ANNOTATION: &str = "k8s-offload.dev/no-offload";
pub const WORKLOAD_TYPE_ANNOTATION: &str = "k8s-offload.dev/workload-type";
pub const GPU_ANNOTATION: &str = "k8s-offload.dev/gpu";
pub const CPU_ANNOTATION: &str = "k8s-offload.dev/cpu";
pub const MEMORY_ANNOTATION: &str = "k8s-offload.dev/memory";
pub const TIMEOUT_ANNOTATION: &str = "k8s-offload.dev/timeout-seconds";
pub const RETRIES_ANNOTATION: &str = "k8s-offload.dev/retries";
pub const REPLICAS_ANNOTATION: &str = "k8s-offload.dev/replicas";
pub const NETWORKING_ANNOTATION: &str = "k8s-offload.dev/networking";
pub const TUNNEL_ANNOTATION: &str = "k8s-offload.dev/tunnel";
pub const TUNNEL_PORT_ANNOTATION: &str = "k8s-offload.dev/tunnel-port";
pub const IMAGE_ANNOTATION: &str = "k8s-offload.dev/image";
pub const COMMAND_ANNOTATION: &str = "k8s-offload.dev/command";
pub const ENV_ANNOTATION_PREFIX: &str = "k8s-offload.dev/env-";

/// Written by the webhook when it mutates a pod; its presence stops the
/// webhook from intercepting the same pod twice.
pub const MUTATED_ANNOTATION: &str = "k8s-offload.dev/mutated";
/// JSON record of the pod's containers as they were before mutation.
pub const ORIGINAL_CONTAINERS_ANNOTATION: &str = "k8s-offload.dev/original-containers";

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error("'{}' is not a recognized annotation!", .0)]
    UnknownKey(String),
    #[error("'{value}' is not a valid value for the '{key}' annotation!")]
    InvalidValue { key: String, value: String },
    #[error("The recorded container spec couldn't be deserialized! Reason: {}", .0)]
    InvalidContainerRecord(#[source] serde_json::Error),
    #[error("The pod carries no recorded container spec!")]
    MissingContainerRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkloadKind {
    #[default]
    Job,
    Endpoint,
}

/// Validated view of a pod's offload annotations. Produced only by
/// [`parse_directives`], which rejects unknown or malformed keys instead
/// of guessing what the author meant.
#[derive(Debug, Clone, Default)]
pub struct OffloadDirectives {
    pub requested: bool,
    pub opt_out: bool,
    pub kind: WorkloadKind,
    pub gpu: Option<String>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub retries: Option<u32>,
    pub replicas: Option<u32>,
    pub networking: bool,
    pub tunnel: bool,
    pub tunnel_port: Option<u16>,
    pub image_override: Option<String>,
    pub command_override: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub already_mutated: bool,
}

pub fn parse_directives(
    annotations: &BTreeMap<String, String>,
) -> Result<OffloadDirectives, AnnotationError> {
    let mut directives = OffloadDirectives::default();

    for (key, value) in annotations {
        if !key.starts_with(RESOURCE_GROUP) {
            continue;
        }

        if let Some(name) = key.strip_prefix(ENV_ANNOTATION_PREFIX) {
            directives.env.insert(name.to_owned(), value.clone());
            continue;
        }

        match key.as_str() {
            OFFLOAD_ANNOTATION => directives.requested = parse_bool(key, value)?,
            OPT_OUT_ANNOTATION => directives.opt_out = parse_bool(key, value)?,
            WORKLOAD_TYPE_ANNOTATION => {
                directives.kind = match value.as_str() {
                    "job" => WorkloadKind::Job,
                    "endpoint" => WorkloadKind::Endpoint,
                    _ => return Err(invalid(key, value)),
                }
            }
            GPU_ANNOTATION => directives.gpu = Some(value.clone()),
            CPU_ANNOTATION => directives.cpu = Some(value.clone()),
            MEMORY_ANNOTATION => directives.memory = Some(value.clone()),
            TIMEOUT_ANNOTATION => directives.timeout_seconds = Some(parse_number(key, value)?),
            RETRIES_ANNOTATION => directives.retries = Some(parse_number(key, value)?),
            REPLICAS_ANNOTATION => directives.replicas = Some(parse_number(key, value)?),
            NETWORKING_ANNOTATION => directives.networking = parse_bool(key, value)?,
            TUNNEL_ANNOTATION => directives.tunnel = parse_bool(key, value)?,
            TUNNEL_PORT_ANNOTATION => directives.tunnel_port = Some(parse_number(key, value)?),
            IMAGE_ANNOTATION => directives.image_override = Some(value.clone()),
            COMMAND_ANNOTATION => {
                directives.command_override =
                    Some(serde_json::from_str(value).map_err(|_| invalid(key, value))?)
            }
            MUTATED_ANNOTATION => directives.already_mutated = parse_bool(key, value)?,
            ORIGINAL_CONTAINERS_ANNOTATION => (),
            _ => return Err(AnnotationError::UnknownKey(key.clone())),
        }
    }

    Ok(directives)
}

fn invalid(key: &str, value: &str) -> AnnotationError {
    AnnotationError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AnnotationError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AnnotationError> {
    value.parse().map_err(|_| invalid(key, value))
}

/// Pre-mutation snapshot of a container, enough to rebuild the workload
/// the pod originally asked for.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordedContainer {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_count: u32,
}

pub fn record_containers(containers: &[RecordedContainer]) -> Result<String, AnnotationError> {
    serde_json::to_string(containers).map_err(AnnotationError::InvalidContainerRecord)
}

pub fn recall_containers(
    annotations: &BTreeMap<String, String>,
) -> Result<Vec<RecordedContainer>, AnnotationError> {
    let record = annotations
        .get(ORIGINAL_CONTAINERS_ANNOTATION)
        .ok_or(AnnotationError::MissingContainerRecord)?;

    serde_json::from_str(record).map_err(AnnotationError::InvalidContainerRecord)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn directives_are_parsed_from_prefixed_keys() {
        let annotations = annotations(&[
            (OFFLOAD_ANNOTATION, "true"),
            (GPU_ANNOTATION, "A100:2"),
            (REPLICAS_ANNOTATION, "4"),
            (NETWORKING_ANNOTATION, "true"),
            ("k8s-offload.dev/env-LOG_LEVEL", "debug"),
            ("unrelated.io/annotation", "ignored"),
        ]);

        let directives = parse_directives(&annotations).unwrap();

        assert!(directives.requested);
        assert_eq!(directives.gpu.as_deref(), Some("A100:2"));
        assert_eq!(directives.replicas, Some(4));
        assert!(directives.networking);
        assert_eq!(directives.env["LOG_LEVEL"], "debug");
    }

    #[test]
    fn unknown_prefixed_keys_are_rejected() {
        let annotations = annotations(&[("k8s-offload.dev/tpyo", "true")]);

        assert!(matches!(
            parse_directives(&annotations),
            Err(AnnotationError::UnknownKey(_))
        ));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let annotations = annotations(&[(REPLICAS_ANNOTATION, "four")]);

        assert!(matches!(
            parse_directives(&annotations),
            Err(AnnotationError::InvalidValue { .. })
        ));

        let annotations = self::annotations(&[(OFFLOAD_ANNOTATION, "yes")]);

        assert!(matches!(
            parse_directives(&annotations),
            Err(AnnotationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn container_record_round_trips_through_the_annotation() {
        let containers = vec![RecordedContainer {
            name: "trainer".to_owned(),
            image: "pytorch/pytorch:latest".to_owned(),
            command: vec!["python".to_owned(), "train.py".to_owned()],
            args: Vec::new(),
            env: BTreeMap::from([("EPOCHS".to_owned(), "10".to_owned())]),
            gpu_count: 1,
        }];

        let record = record_containers(&containers).unwrap();
        let annotations = BTreeMap::from([(ORIGINAL_CONTAINERS_ANNOTATION.to_owned(), record)]);

        assert_eq!(recall_containers(&annotations).unwrap(), containers);
    }
}
