use std::{future::Future, sync::Arc, time::Duration};

use json_patch::Patch;
use k8s_openapi::api::core::v1::Pod;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use log::{info, warn};
use warp::Filter;

use crate::{config::OperatorConfig, metrics::Metrics};

use self::mutate::evaluate;

pub mod mutate;

/// Serves the mutating admission endpoint over TLS.
pub async fn start_webhook_server(config: OperatorConfig, metrics: Arc<Metrics>) {
    info!(
        "Starting the admission webhook on port {}...",
        config.webhook_port
    );

    let fail_open = config.webhook_fail_open;
    let budget = config.webhook_latency_budget;
    let mutate = warp::post()
        .and(warp::path("mutate"))
        .and(warp::body::json())
        .then(move |review: AdmissionReview<Pod>| {
            let metrics = metrics.clone();

            async move { warp::reply::json(&review_pod(review, fail_open, budget, &metrics).await) }
        });

    warp::serve(mutate)
        .tls()
        .cert_path(&config.webhook_cert_path)
        .key_path(&config.webhook_key_path)
        .run(([0, 0, 0, 0], config.webhook_port))
        .await
}

async fn review_pod(
    review: AdmissionReview<Pod>,
    fail_open: bool,
    budget: Duration,
    metrics: &Metrics,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<Pod> = match review.try_into() {
        Ok(request) => request,
        Err(error) => {
            warn!("Received a malformed admission review! {error:?}");
            Metrics::increment(&metrics.admission_errors);

            return AdmissionResponse::invalid(error.to_string()).into_review();
        }
    };

    let response = AdmissionResponse::from(&request);
    let Some(pod) = &request.object else {
        return response.into_review();
    };

    let Some(evaluated) = with_latency_budget(budget, async { evaluate(pod) }).await else {
        warn!(
            "The admission review for '{}' exhausted the {}s latency budget!",
            request.name,
            budget.as_secs()
        );
        Metrics::increment(&metrics.admission_errors);

        return admit_or_deny(response, fail_open, "the review took too long");
    };

    match evaluated {
        Ok(Some(decision)) => {
            Metrics::increment(&metrics.pods_intercepted);

            info!(
                "Intercepting pod '{}' for remote execution",
                request.name
            );

            match response.with_patch(Patch(decision.patches)) {
                Ok(patched) => patched.into_review(),
                Err(error) => {
                    warn!("Couldn't attach the mutation patch! {error:?}");
                    Metrics::increment(&metrics.admission_errors);

                    admit_or_deny(AdmissionResponse::from(&request), fail_open, &error.to_string())
                }
            }
        }
        Ok(None) => response.into_review(),
        Err(error) => {
            Metrics::increment(&metrics.admission_errors);

            admit_or_deny(response, fail_open, &error.to_string())
        }
    }
}

/// The API server only waits so long for a webhook answer; an overrun
/// review falls into the same admit-or-deny path as a failed one.
async fn with_latency_budget<T>(budget: Duration, review: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(budget, review).await.ok()
}

fn admit_or_deny(
    response: AdmissionResponse,
    fail_open: bool,
    message: &str,
) -> AdmissionReview<DynamicObject> {
    match fail_open {
        true => {
            warn!("Admitting the pod unmodified! {message}");
            response.into_review()
        }
        false => response.deny(message).into_review(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_offload_core::resources::annotations::OFFLOAD_ANNOTATION;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::core::ObjectMeta;

    use super::*;

    fn admission_review(pod: Pod) -> AdmissionReview<Pod> {
        let request = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "review-1",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "operation": "CREATE",
                "name": "workload",
                "userInfo": {},
                "object": pod,
            }
        });

        serde_json::from_value(request).unwrap()
    }

    fn annotated_pod(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("workload".to_owned()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(key, value)| (key.to_string(), value.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "trainer".to_owned(),
                    image: Some("busybox".to_owned()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    const BUDGET: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn opted_in_pods_get_a_patch() {
        let metrics = Metrics::default();
        let review = admission_review(annotated_pod(&[(OFFLOAD_ANNOTATION, "true")]));

        let result = review_pod(review, true, BUDGET, &metrics).await;

        let response = result.response.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_some());
    }

    #[tokio::test]
    async fn malformed_annotations_fail_open_by_default() {
        let metrics = Metrics::default();
        let review = admission_review(annotated_pod(&[("k8s-offload.dev/bogus", "true")]));

        let result = review_pod(review, true, BUDGET, &metrics).await;

        let response = result.response.unwrap();
        assert!(response.allowed);
        assert!(response.patch.is_none());
    }

    #[tokio::test]
    async fn malformed_annotations_can_fail_closed() {
        let metrics = Metrics::default();
        let review = admission_review(annotated_pod(&[("k8s-offload.dev/bogus", "true")]));

        let result = review_pod(review, false, BUDGET, &metrics).await;

        assert!(!result.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn an_exhausted_latency_budget_gives_up_on_the_review() {
        let outcome =
            with_latency_budget(Duration::from_millis(5), std::future::pending::<()>()).await;

        assert_eq!(outcome, None);
    }
}
