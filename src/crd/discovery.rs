use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reference to a Secret holding a kubeconfig for a remote cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct KubeconfigRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Secret key the kubeconfig lives under; defaults to "kubeconfig"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Workload-identity federation parameters for a remote cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkloadIdentityRef {
    #[serde(rename = "projectNumber")]
    pub project_number: String,
    #[serde(rename = "serviceAccount")]
    pub service_account: String,
}

/// Addressing and credentials for one cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "kubeconfigRef"
    )]
    pub kubeconfig_ref: Option<KubeconfigRef>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "workloadIdentityRef"
    )]
    pub workload_identity_ref: Option<WorkloadIdentityRef>,
}

/// One environment discovery walks and deployment may target
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct EnvironmentSpec {
    pub name: String,
    #[serde(default)]
    pub cluster: ClusterRef,
    /// Namespaces to enumerate; empty means the cluster ref's namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    /// Catalog kinds to discover, by component value; empty means all
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        rename = "resourceTypes"
    )]
    pub resource_types: Vec<String>,
    #[serde(default = "default_true", rename = "discoveryEnabled")]
    pub discovery_enabled: bool,
    #[serde(default, rename = "deployEnabled")]
    pub deploy_enabled: bool,
    /// Extra labels stamped onto records discovered from this environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl EnvironmentSpec {
    /// Namespaces a sync enumerates, falling back to the cluster namespace
    pub fn sync_namespaces(&self) -> Vec<String> {
        if !self.namespaces.is_empty() {
            return self.namespaces.clone();
        }
        self.cluster.namespace.clone().into_iter().collect()
    }

    /// Whether this environment discovers the given component kind
    pub fn discovers(&self, component: &str) -> bool {
        self.resource_types.is_empty() || self.resource_types.iter().any(|t| t == component)
    }
}

/// Per-kind tallies of discovered records
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiscoveredResources {
    #[serde(default, rename = "mcpServers")]
    pub mcp_servers: u32,
    #[serde(default)]
    pub agents: u32,
    #[serde(default)]
    pub skills: u32,
    #[serde(default)]
    pub models: u32,
}

/// Observed state of one environment
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EnvironmentStatus {
    pub name: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "lastSyncTime"
    )]
    pub last_sync_time: Option<Time>,
    #[serde(default, rename = "discoveredResources")]
    pub discovered_resources: DiscoveredResources,
}

/// DiscoveryConfig status information
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DiscoveryConfigStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "lastSyncTime"
    )]
    pub last_sync_time: Option<Time>,
}

/// The DiscoveryConfig CustomResource: the set of environments the
/// discovery engine walks.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "DiscoveryConfig",
    shortname = "disc",
    namespaced,
    schema = "disabled",
    status = "DiscoveryConfigStatus",
    printcolumn = r#"{"name":"Environments", "jsonPath":".spec.environments[*].name", "type":"string"}"#,
    printcolumn = r#"{"name":"Last Sync", "jsonPath":".status.lastSyncTime", "type":"date"}"#
)]
pub struct DiscoveryConfigSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<EnvironmentSpec>,
}
