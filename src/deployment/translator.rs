use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{DynamicObject, ObjectMeta, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::{
    sanitize, CatalogEntry, RegistryDeployment, ResourceType, RuntimeType,
    ANNOTATION_CONFIG_HASH, LABEL_MANAGED_BY, LABEL_NAME, LABEL_RESOURCE_SOURCE, LABEL_VERSION,
    MANAGER,
};
use crate::error::{AppError, AppResult};
use crate::kubernetes::api::to_dynamic;

const DEFAULT_PORT: i32 = 8080;

/// Merges the catalog's default configuration with the deployment's
/// overrides. Patch semantics are key-wise overwrite; an empty string
/// removes the key - the only way to unset, omission never deletes.
pub fn merge_config(
    base: &BTreeMap<String, String>,
    overlay: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        if value.is_empty() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Content hash of the rendered configuration, projected into the pod
/// template so config changes roll the workload.
fn config_hash(config: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in config {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn workload_labels(entry: &CatalogEntry, rd: &RegistryDeployment) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER.to_string());
    labels.insert(LABEL_NAME.to_string(), sanitize(&entry.name));
    labels.insert(LABEL_VERSION.to_string(), sanitize(&entry.version));
    labels.insert(LABEL_RESOURCE_SOURCE.to_string(), "deployment".to_string());
    labels.insert(
        "app.kubernetes.io/instance".to_string(),
        rd.name_any(),
    );
    labels
}

/// First deployable package of the catalog entry. Only OCI images run on
/// the kubernetes runtime.
fn deployable_image(entry: &CatalogEntry) -> AppResult<String> {
    entry
        .packages
        .iter()
        .find(|p| p.registry_type == "oci" || p.registry_type == "docker")
        .map(|p| p.identifier.clone())
        .ok_or_else(|| {
            AppError::InvalidInput(format!(
                "catalog record {} has no OCI package to deploy",
                entry.name
            ))
        })
}

/// Translates a resolved catalog record plus deployment intent into the
/// workload objects for the target namespace. Deterministic: identical
/// inputs produce byte-identical output, ordering included, so plans can
/// be diffed cheaply. Selected by runtime variant.
pub fn translate(
    entry: &CatalogEntry,
    rd: &RegistryDeployment,
) -> AppResult<Vec<DynamicObject>> {
    match rd.spec.runtime {
        RuntimeType::Kubernetes => translate_kubernetes(entry, rd),
    }
}

fn translate_kubernetes(
    entry: &CatalogEntry,
    rd: &RegistryDeployment,
) -> AppResult<Vec<DynamicObject>> {
    let namespace = rd.target_namespace().ok_or_else(|| {
        AppError::InvalidInput(format!("deployment {} has no target namespace", rd.name_any()))
    })?;
    let name = rd.name_any();
    let image = deployable_image(entry)?;
    let labels = workload_labels(entry, rd);

    let base_env = entry
        .packages
        .iter()
        .find(|p| p.registry_type == "oci" || p.registry_type == "docker")
        .map(|p| p.environment_variables.clone())
        .unwrap_or_default();
    let config = merge_config(&base_env, &rd.spec.config);

    let mut objects = Vec::new();

    let config_map_name = format!("{}-config", name);
    if !config.is_empty() {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(config_map_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            data: Some(config.clone()),
            ..Default::default()
        };
        objects.push(to_dynamic(&config_map, "v1", "ConfigMap")?);
    }

    let mut pod_annotations = BTreeMap::new();
    pod_annotations.insert(ANNOTATION_CONFIG_HASH.to_string(), config_hash(&config));

    let env_from = if config.is_empty() {
        None
    } else {
        Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: config_map_name.into(),
                optional: Some(false),
            }),
            ..Default::default()
        }])
    };

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(labels.clone()),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(image),
                        ports: Some(vec![ContainerPort {
                            container_port: DEFAULT_PORT,
                            ..Default::default()
                        }]),
                        env_from,
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    objects.push(to_dynamic(&deployment, "apps/v1", "Deployment")?);

    // MCP servers always expose an endpoint; agents only when the catalog
    // carries a remote transport
    let needs_service =
        rd.spec.resource_type == ResourceType::Mcp || !entry.remotes.is_empty();
    if needs_service {
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    port: DEFAULT_PORT,
                    target_port: Some(IntOrString::Int(DEFAULT_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        objects.push(to_dynamic(&service, "v1", "Service")?);
    }

    Ok(objects)
}
