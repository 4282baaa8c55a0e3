use std::collections::BTreeMap;

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use k8s_offload_core::resources::{
    annotations::{
        parse_directives, record_containers, AnnotationError, RecordedContainer, WorkloadKind,
        MUTATED_ANNOTATION, ORIGINAL_CONTAINERS_ANNOTATION,
    },
    labels::INTERCEPTED_LABEL,
};
use k8s_openapi::api::core::v1::{Container, Pod};
use serde_json::{json, Value};

pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const PLACEHOLDER_CONTAINER_NAME: &str = "offload-placeholder";
pub const PLACEHOLDER_IMAGE: &str = "registry.k8s.io/pause:3.9";

#[derive(Debug)]
pub struct InterceptDecision {
    pub patches: Vec<PatchOperation>,
    pub kind: WorkloadKind,
}

/// Decides whether a pod gets offloaded, and with which mutations.
///
/// Intercepts iff the pod opts in through an annotation or requests a GPU,
/// carries no opt-out marker and wasn't mutated before. The mutation swaps
/// all containers for a single placeholder (which also strips the GPU
/// requests the node scheduler would otherwise see), records the original
/// containers in an annotation and labels the pod for the companion
/// controller. Malformed annotations surface as an error so the caller can
/// apply its fail-open policy.
pub fn evaluate(pod: &Pod) -> Result<Option<InterceptDecision>, AnnotationError> {
    let empty = BTreeMap::new();
    let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);
    let directives = parse_directives(annotations)?;

    if directives.opt_out || directives.already_mutated {
        return Ok(None);
    }

    let containers = match pod.spec.as_ref() {
        Some(spec) => &spec.containers,
        None => return Ok(None),
    };

    let recorded: Vec<RecordedContainer> = containers.iter().map(record_container).collect();
    let gpu_requested = recorded.iter().any(|container| container.gpu_count > 0);

    if !directives.requested && !gpu_requested {
        return Ok(None);
    }

    let mut patches = vec![replace(
        "/spec/containers".to_owned(),
        json!([placeholder_container()]),
    )];

    if pod.metadata.annotations.is_none() {
        patches.push(add("/metadata/annotations".to_owned(), json!({})));
    }
    patches.push(add(
        annotation_path(MUTATED_ANNOTATION),
        json!("true"),
    ));
    patches.push(add(
        annotation_path(ORIGINAL_CONTAINERS_ANNOTATION),
        json!(record_containers(&recorded)?),
    ));

    if pod.metadata.labels.is_none() {
        patches.push(add("/metadata/labels".to_owned(), json!({})));
    }
    patches.push(add(
        format!("/metadata/labels/{}", escape_pointer(INTERCEPTED_LABEL)),
        json!("true"),
    ));

    Ok(Some(InterceptDecision {
        patches,
        kind: directives.kind,
    }))
}

fn placeholder_container() -> Value {
    json!({
        "name": PLACEHOLDER_CONTAINER_NAME,
        "image": PLACEHOLDER_IMAGE,
    })
}

fn record_container(container: &Container) -> RecordedContainer {
    let env = container
        .env
        .iter()
        .flatten()
        .filter_map(|var| Some((var.name.clone(), var.value.clone()?)))
        .collect();

    RecordedContainer {
        name: container.name.clone(),
        image: container.image.clone().unwrap_or_default(),
        command: container.command.clone().unwrap_or_default(),
        args: container.args.clone().unwrap_or_default(),
        env,
        gpu_count: gpu_count(container),
    }
}

fn gpu_count(container: &Container) -> u32 {
    let Some(resources) = &container.resources else {
        return 0;
    };

    [&resources.limits, &resources.requests]
        .into_iter()
        .flatten()
        .filter_map(|claims| claims.get(GPU_RESOURCE_NAME))
        .filter_map(|quantity| quantity.0.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

fn annotation_path(annotation: &str) -> String {
    format!("/metadata/annotations/{}", escape_pointer(annotation))
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

fn add(path: String, value: Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path, value })
}

fn replace(path: String, value: Value) -> PatchOperation {
    PatchOperation::Replace(ReplaceOperation { path, value })
}
