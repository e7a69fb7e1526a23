use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Catalog kind a deployment resolves its record from
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Mcp,
    Agent,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Mcp => write!(f, "mcp"),
            ResourceType::Agent => write!(f, "agent"),
        }
    }
}

/// Target runtime. A sum type on purpose: a second runtime lands as a new
/// variant plus a translator arm, with no scheduler or status changes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Kubernetes,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

/// Observed lifecycle phase of a deployment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum DeploymentPhase {
    #[default]
    Pending,
    Running,
    Failed,
    Terminating,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentPhase::Pending => write!(f, "Pending"),
            DeploymentPhase::Running => write!(f, "Running"),
            DeploymentPhase::Failed => write!(f, "Failed"),
            DeploymentPhase::Terminating => write!(f, "Terminating"),
        }
    }
}

impl DeploymentPhase {
    /// Phase transitions are monotonic: Pending may move to Running or
    /// Failed, Running may move to Failed, and anything may move to
    /// Terminating. Failed and Terminating are terminal short of deletion.
    pub fn can_transition_to(self, next: DeploymentPhase) -> bool {
        use DeploymentPhase::*;
        match (self, next) {
            (a, b) if a == b => true,
            (_, Terminating) => true,
            (Terminating, _) => false,
            (Pending, Running) | (Pending, Failed) | (Running, Failed) => true,
            _ => false,
        }
    }
}

/// A workload object created and tracked by the deployment engine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ManagedResource {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// RegistryDeployment status information
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RegistryDeploymentStatus {
    #[serde(default)]
    pub phase: DeploymentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "deployedAt")]
    pub deployed_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "updatedAt")]
    pub updated_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        rename = "managedResources"
    )]
    pub managed_resources: Vec<ManagedResource>,
}

/// The RegistryDeployment CustomResource: intent to run one catalog record
/// in a target namespace.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "RegistryDeployment",
    shortname = "regd",
    namespaced,
    schema = "disabled",
    status = "RegistryDeploymentStatus",
    printcolumn = r#"{"name":"Resource", "jsonPath":".spec.resourceName", "type":"string"}"#,
    printcolumn = r#"{"name":"Version", "jsonPath":".spec.version", "type":"string"}"#,
    printcolumn = r#"{"name":"Type", "jsonPath":".spec.resourceType", "type":"string"}"#,
    printcolumn = r#"{"name":"Phase", "jsonPath":".status.phase", "type":"string"}"#
)]
pub struct RegistryDeploymentSpec {
    /// Catalog spec name to deploy
    #[serde(rename = "resourceName")]
    pub resource_name: String,
    pub version: String,
    #[serde(rename = "resourceType")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub runtime: RuntimeType,
    /// Prefer a connected deploy-enabled remote environment over the local
    /// cluster
    #[serde(default, rename = "preferRemote")]
    pub prefer_remote: bool,
    /// Flat configuration map; an empty string value removes the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
    /// Target namespace; defaults to the record's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl RegistryDeployment {
    /// Namespace workload objects land in
    pub fn target_namespace(&self) -> Option<String> {
        self.spec
            .namespace
            .clone()
            .or_else(|| self.metadata.namespace.clone())
    }

    pub fn phase(&self) -> DeploymentPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
