use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;

use crate::crd::{
    store_name, CatalogEntry, EnvironmentSpec, PackageRef, RemoteEndpoint, LABEL_DISCOVERED,
    LABEL_ENVIRONMENT, LABEL_NAME, LABEL_RESOURCE_SOURCE, LABEL_VERSION,
};
use crate::error::{AppError, AppResult};

const ANNOTATION_TITLE: &str = "agentregistry.dev/title";
const ANNOTATION_DESCRIPTION: &str = "agentregistry.dev/description";
const ANNOTATION_ENDPOINT: &str = "agentregistry.dev/endpoint";
const ANNOTATION_TRANSPORT: &str = "agentregistry.dev/transport";

/// A live workload projected into catalog shape
#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveredRecord {
    pub store_name: String,
    pub entry: CatalogEntry,
}

fn first_image(live: &Deployment) -> Option<String> {
    live.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

/// Version tag of an image reference, if it carries one. Digest-pinned
/// references have no usable tag.
fn image_tag(image: &str) -> Option<&str> {
    let after_slash = image.rsplit('/').next().unwrap_or(image);
    if after_slash.contains('@') {
        return None;
    }
    let (_, tag) = after_slash.split_once(':')?;
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

/// Projects a live Deployment into a catalog entry. Pure and stable: the
/// same live object always produces the same projection, so re-running a
/// sync against an unchanged cluster writes nothing.
pub fn project_deployment(live: &Deployment) -> AppResult<DiscoveredRecord> {
    let labels = live.labels();
    let annotations = live.annotations();

    let name = labels
        .get(LABEL_NAME)
        .cloned()
        .unwrap_or_else(|| live.name_any());
    if name.is_empty() {
        return Err(AppError::InvalidInput(
            "live object has neither a name label nor a metadata name".to_string(),
        ));
    }

    let image = first_image(live);
    let version = labels
        .get(LABEL_VERSION)
        .cloned()
        .or_else(|| {
            image
                .as_deref()
                .and_then(image_tag)
                .map(|tag| tag.to_string())
        })
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "workload {} has no version label and no tagged image",
                name
            ))
        })?;

    let packages = image
        .map(|identifier| {
            vec![PackageRef {
                registry_type: "oci".to_string(),
                identifier,
                version: Some(version.clone()),
                ..Default::default()
            }]
        })
        .unwrap_or_default();

    let remotes = annotations
        .get(ANNOTATION_ENDPOINT)
        .map(|url| {
            vec![RemoteEndpoint {
                transport_type: annotations
                    .get(ANNOTATION_TRANSPORT)
                    .cloned()
                    .unwrap_or_else(|| "streamable-http".to_string()),
                url: url.clone(),
                headers: BTreeMap::new(),
            }]
        })
        .unwrap_or_default();

    Ok(DiscoveredRecord {
        store_name: store_name(&name, &version),
        entry: CatalogEntry {
            name,
            version,
            title: annotations.get(ANNOTATION_TITLE).cloned(),
            description: annotations.get(ANNOTATION_DESCRIPTION).cloned(),
            repository: None,
            packages,
            remotes,
            publisher_metadata: None,
        },
    })
}

/// Labels stamped onto a record discovered from `env`, marking discovery
/// ownership and the reclamation scope.
pub fn discovered_labels(env: &EnvironmentSpec, entry: &CatalogEntry) -> BTreeMap<String, String> {
    let mut labels = env.labels.clone();
    labels.insert(LABEL_DISCOVERED.to_string(), "true".to_string());
    labels.insert(LABEL_ENVIRONMENT.to_string(), env.name.clone());
    labels.insert(LABEL_RESOURCE_SOURCE.to_string(), "discovery".to_string());
    labels.insert(LABEL_NAME.to_string(), crate::crd::sanitize(&entry.name));
    labels.insert(
        LABEL_VERSION.to_string(),
        crate::crd::sanitize(&entry.version),
    );
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;
    use rstest::rstest;

    fn live(
        name: &str,
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
        image: Option<&str>,
    ) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: name.to_string(),
                            image: image.map(|i| i.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn labels_win_over_image_metadata() {
        let deploy = live(
            "filesys",
            &[
                ("agentregistry.dev/name", "filesys"),
                ("agentregistry.dev/version", "1.2.3"),
            ],
            &[("agentregistry.dev/description", "file server")],
            Some("ghcr.io/acme/filesys:9.9.9"),
        );
        let record = project_deployment(&deploy).expect("projects");
        assert_eq!(record.store_name, "filesys-1-2-3");
        assert_eq!(record.entry.version, "1.2.3");
        assert_eq!(record.entry.description.as_deref(), Some("file server"));
        assert_eq!(record.entry.packages[0].identifier, "ghcr.io/acme/filesys:9.9.9");
    }

    #[test]
    fn version_falls_back_to_the_image_tag() {
        let deploy = live("filesys", &[], &[], Some("ghcr.io/acme/filesys:1.2.3"));
        let record = project_deployment(&deploy).expect("projects");
        assert_eq!(record.entry.version, "1.2.3");
        assert_eq!(record.store_name, "filesys-1-2-3");
    }

    #[test]
    fn unversioned_workloads_are_skipped() {
        let deploy = live("filesys", &[], &[], Some("ghcr.io/acme/filesys"));
        assert!(project_deployment(&deploy).is_err());

        let digest = live(
            "filesys",
            &[],
            &[],
            Some("ghcr.io/acme/filesys@sha256:abcd"),
        );
        assert!(project_deployment(&digest).is_err());
    }

    #[test]
    fn projection_is_pure() {
        let deploy = live(
            "filesys",
            &[("agentregistry.dev/version", "1.2.3")],
            &[("agentregistry.dev/endpoint", "http://filesys.prod:8080/mcp")],
            Some("ghcr.io/acme/filesys:1.2.3"),
        );
        assert_eq!(
            project_deployment(&deploy).expect("projects"),
            project_deployment(&deploy).expect("projects")
        );
    }

    #[rstest]
    #[case("ghcr.io/acme/filesys:1.2.3", Some("1.2.3"))]
    #[case("filesys:latest", Some("latest"))]
    #[case("localhost:5000/acme/filesys:2.0", Some("2.0"))]
    #[case("ghcr.io/acme/filesys", None)]
    #[case("ghcr.io/acme/filesys@sha256:abcd", None)]
    fn image_tags_parse_conservatively(#[case] image: &str, #[case] expected: Option<&str>) {
        assert_eq!(image_tag(image), expected);
    }

    #[test]
    fn discovered_labels_carry_scope_and_ownership() {
        let env = EnvironmentSpec {
            name: "prod".to_string(),
            labels: [("team".to_string(), "infra".to_string())].into(),
            ..Default::default()
        };
        let entry = CatalogEntry {
            name: "filesys".to_string(),
            version: "1.2.3".to_string(),
            ..Default::default()
        };
        let labels = discovered_labels(&env, &entry);
        assert_eq!(labels.get("agentregistry.dev/discovered").map(String::as_str), Some("true"));
        assert_eq!(labels.get("agentregistry.dev/environment").map(String::as_str), Some("prod"));
        assert_eq!(labels.get("agentregistry.dev/version").map(String::as_str), Some("1-2-3"));
        assert_eq!(labels.get("team").map(String::as_str), Some("infra"));
    }
}
