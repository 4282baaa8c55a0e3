use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::{core::ObjectMeta, Resource, ResourceExt};
use thiserror::Error;

use crate::resources::crd::v1alpha1::endpoint::RemoteEndpoint;

const HTTPS_PORT: i32 = 443;
const HTTP_PORT: i32 = 80;

#[derive(Debug, Error)]
pub enum ServiceGenerationError {
    #[error("'{}' is not a valid endpoint URL!", .0)]
    InvalidUrl(String),
    #[error("The endpoint is missing object metadata!")]
    MissingMetadata,
}

/// Generates the in-cluster `ExternalName` Service resolving the endpoint's
/// name to the remote stable URL's host. Owned by the endpoint so garbage
/// collection removes it together with the resource.
pub fn generate_endpoint_service(
    endpoint: &RemoteEndpoint,
    url: &str,
) -> Result<Service, ServiceGenerationError> {
    let (https, host) = split_url(url)?;
    let owner_ref = endpoint
        .controller_owner_ref(&())
        .ok_or(ServiceGenerationError::MissingMetadata)?;

    let port = ServicePort {
        name: Some("http".to_owned()),
        port: match https {
            true => HTTPS_PORT,
            false => HTTP_PORT,
        },
        protocol: Some("TCP".to_owned()),
        ..Default::default()
    };

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(endpoint.name_any()),
            namespace: endpoint.namespace(),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_owned()),
            external_name: Some(host.to_owned()),
            ports: Some(vec![port]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn split_url(url: &str) -> Result<(bool, &str), ServiceGenerationError> {
    let (https, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (false, rest)
    } else {
        return Err(ServiceGenerationError::InvalidUrl(url.to_owned()));
    };

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(ServiceGenerationError::InvalidUrl(url.to_owned()));
    }

    Ok((https, host))
}

#[cfg(test)]
mod tests {
    use kube::core::ObjectMeta;

    use crate::resources::crd::v1alpha1::endpoint::RemoteEndpointSpec;

    use super::*;

    fn endpoint() -> RemoteEndpoint {
        RemoteEndpoint {
            metadata: ObjectMeta {
                name: Some("inference".to_owned()),
                namespace: Some("default".to_owned()),
                uid: Some("abc-123".to_owned()),
                ..Default::default()
            },
            spec: RemoteEndpointSpec::default(),
            status: None,
        }
    }

    #[test]
    fn service_points_at_the_url_host() {
        let service =
            generate_endpoint_service(&endpoint(), "https://inference-abc.example.run/v1").unwrap();

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ExternalName"));
        assert_eq!(spec.external_name.as_deref(), Some("inference-abc.example.run"));
        assert_eq!(spec.ports.unwrap()[0].port, HTTPS_PORT);
        assert_eq!(
            service.metadata.owner_references.unwrap()[0].kind,
            "RemoteEndpoint"
        );
    }

    #[test]
    fn schemeless_urls_are_rejected() {
        assert!(matches!(
            generate_endpoint_service(&endpoint(), "inference-abc.example.run"),
            Err(ServiceGenerationError::InvalidUrl(_))
        ));
    }
}
