use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use k8s_openapi::NamespaceResourceScope;
use kube::CustomResource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source repository information for a catalog entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Repository {
    pub url: String,
    /// Hosting source, e.g. "github"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A distributable package backing a catalog entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PackageRef {
    /// Package registry the identifier resolves against, e.g. "oci", "npm"
    #[serde(rename = "registryType")]
    pub registry_type: String,
    /// Registry-specific identifier; for "oci" this is the image reference
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        rename = "environmentVariables"
    )]
    pub environment_variables: BTreeMap<String, String>,
}

/// A remotely reachable endpoint for a catalog entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RemoteEndpoint {
    /// Transport the endpoint speaks, e.g. "sse", "streamable-http"
    #[serde(rename = "transportType")]
    pub transport_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// The spec shape shared by all four catalog kinds. `name` and `version`
/// are set at create time and immutable; the store-name encodes both.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CatalogEntry {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Repository>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remotes: Vec<RemoteEndpoint>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "publisherMetadata"
    )]
    pub publisher_metadata: Option<serde_json::Value>,
}

/// Back-reference to an agent whose spec references this record
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct UsedByRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// Advisory pointer written by the deployment engine. Its absence or
/// staleness never changes catalog reconciliation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct DeploymentRef {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "lastChecked")]
    pub last_checked: Option<Time>,
}

/// Status shared by all catalog kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CatalogStatus {
    /// At most one record per spec name carries true
    #[serde(default, rename = "isLatest")]
    pub is_latest: bool,
    /// Publication gate for servers and skills; unpublished records are
    /// hidden from non-admin readers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "publishedAt")]
    pub published_at: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Derived set of agents referencing this record; models and skills only
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "usedBy")]
    pub used_by: Vec<UsedByRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentRef>,
}

/// The MCPServerCatalog CustomResource
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "MCPServerCatalog",
    shortname = "mcpc",
    namespaced,
    schema = "disabled",
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Name", "jsonPath":".spec.name", "type":"string"}"#,
    printcolumn = r#"{"name":"Version", "jsonPath":".spec.version", "type":"string"}"#,
    printcolumn = r#"{"name":"Latest", "jsonPath":".status.isLatest", "type":"boolean"}"#,
    printcolumn = r#"{"name":"Published", "jsonPath":".status.published", "type":"boolean"}"#
)]
pub struct MCPServerCatalogSpec {
    #[serde(flatten)]
    pub entry: CatalogEntry,
}

/// The AgentCatalog CustomResource. Model and skill references drive the
/// usage back-references on those kinds.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "AgentCatalog",
    shortname = "agc",
    namespaced,
    schema = "disabled",
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Name", "jsonPath":".spec.name", "type":"string"}"#,
    printcolumn = r#"{"name":"Version", "jsonPath":".spec.version", "type":"string"}"#,
    printcolumn = r#"{"name":"Latest", "jsonPath":".status.isLatest", "type":"boolean"}"#
)]
pub struct AgentCatalogSpec {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    /// Model names this agent depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    /// Skill names this agent depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

/// The SkillCatalog CustomResource
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "SkillCatalog",
    shortname = "skc",
    namespaced,
    schema = "disabled",
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Name", "jsonPath":".spec.name", "type":"string"}"#,
    printcolumn = r#"{"name":"Version", "jsonPath":".spec.version", "type":"string"}"#,
    printcolumn = r#"{"name":"Latest", "jsonPath":".status.isLatest", "type":"boolean"}"#,
    printcolumn = r#"{"name":"Published", "jsonPath":".status.published", "type":"boolean"}"#
)]
pub struct SkillCatalogSpec {
    #[serde(flatten)]
    pub entry: CatalogEntry,
}

/// The ModelCatalog CustomResource. Versions are singleton-per-name rather
/// than semver.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize)]
#[kube(
    group = "agentregistry.dev",
    version = "v1alpha1",
    kind = "ModelCatalog",
    shortname = "mdc",
    namespaced,
    schema = "disabled",
    status = "CatalogStatus",
    printcolumn = r#"{"name":"Name", "jsonPath":".spec.name", "type":"string"}"#,
    printcolumn = r#"{"name":"Provider", "jsonPath":".spec.provider", "type":"string"}"#,
    printcolumn = r#"{"name":"Latest", "jsonPath":".status.isLatest", "type":"boolean"}"#
)]
pub struct ModelCatalogSpec {
    #[serde(flatten)]
    pub entry: CatalogEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "modelId")]
    pub model_id: Option<String>,
}

/// Unifies the four catalog kinds for the generic reconciler and the
/// discovery engine.
pub trait CatalogKind:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Kubernetes kind name, e.g. "MCPServerCatalog"
    const KIND: &'static str;
    /// Component label value live workloads use to project into this kind
    const COMPONENT: &'static str;
    /// Whether this kind carries the published/publishedAt state
    const TRACKS_PUBLICATION: bool;
    /// Whether this kind receives usedBy back-references from agents
    const TRACKS_USAGE: bool;
    /// Whether versions order by semver; models are singleton tags instead
    const SEMVER_VERSIONED: bool;

    fn entry(&self) -> &CatalogEntry;
    fn status(&self) -> Option<&CatalogStatus>;

    /// Status for writing, initialized to defaults when absent
    fn status_mut(&mut self) -> &mut CatalogStatus;

    /// Construct a record for the discovery engine; kind-specific spec
    /// extras default.
    fn from_discovered(store_name: &str, entry: CatalogEntry) -> Self;

    /// Serialize the spec a discovered entry projects to, for drift
    /// comparison and spec patches.
    fn discovered_spec_value(entry: &CatalogEntry) -> serde_json::Value;
}

impl CatalogKind for MCPServerCatalog {
    const KIND: &'static str = "MCPServerCatalog";
    const COMPONENT: &'static str = "mcp-server";
    const TRACKS_PUBLICATION: bool = true;
    const TRACKS_USAGE: bool = false;
    const SEMVER_VERSIONED: bool = true;

    fn entry(&self) -> &CatalogEntry {
        &self.spec.entry
    }

    fn status(&self) -> Option<&CatalogStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut CatalogStatus {
        self.status.get_or_insert_with(CatalogStatus::default)
    }

    fn from_discovered(store_name: &str, entry: CatalogEntry) -> Self {
        MCPServerCatalog::new(store_name, MCPServerCatalogSpec { entry })
    }

    fn discovered_spec_value(entry: &CatalogEntry) -> serde_json::Value {
        serde_json::to_value(MCPServerCatalogSpec {
            entry: entry.clone(),
        })
        .unwrap_or_default()
    }
}

impl CatalogKind for AgentCatalog {
    const KIND: &'static str = "AgentCatalog";
    const COMPONENT: &'static str = "agent";
    const TRACKS_PUBLICATION: bool = false;
    const TRACKS_USAGE: bool = false;
    const SEMVER_VERSIONED: bool = true;

    fn entry(&self) -> &CatalogEntry {
        &self.spec.entry
    }

    fn status(&self) -> Option<&CatalogStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut CatalogStatus {
        self.status.get_or_insert_with(CatalogStatus::default)
    }

    fn from_discovered(store_name: &str, entry: CatalogEntry) -> Self {
        AgentCatalog::new(
            store_name,
            AgentCatalogSpec {
                entry,
                models: Vec::new(),
                skills: Vec::new(),
            },
        )
    }

    fn discovered_spec_value(entry: &CatalogEntry) -> serde_json::Value {
        serde_json::to_value(AgentCatalogSpec {
            entry: entry.clone(),
            models: Vec::new(),
            skills: Vec::new(),
        })
        .unwrap_or_default()
    }
}

impl CatalogKind for SkillCatalog {
    const KIND: &'static str = "SkillCatalog";
    const COMPONENT: &'static str = "skill";
    const TRACKS_PUBLICATION: bool = true;
    const TRACKS_USAGE: bool = true;
    const SEMVER_VERSIONED: bool = true;

    fn entry(&self) -> &CatalogEntry {
        &self.spec.entry
    }

    fn status(&self) -> Option<&CatalogStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut CatalogStatus {
        self.status.get_or_insert_with(CatalogStatus::default)
    }

    fn from_discovered(store_name: &str, entry: CatalogEntry) -> Self {
        SkillCatalog::new(store_name, SkillCatalogSpec { entry })
    }

    fn discovered_spec_value(entry: &CatalogEntry) -> serde_json::Value {
        serde_json::to_value(SkillCatalogSpec {
            entry: entry.clone(),
        })
        .unwrap_or_default()
    }
}

impl CatalogKind for ModelCatalog {
    const KIND: &'static str = "ModelCatalog";
    const COMPONENT: &'static str = "model";
    const TRACKS_PUBLICATION: bool = false;
    const TRACKS_USAGE: bool = true;
    const SEMVER_VERSIONED: bool = false;

    fn entry(&self) -> &CatalogEntry {
        &self.spec.entry
    }

    fn status(&self) -> Option<&CatalogStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut CatalogStatus {
        self.status.get_or_insert_with(CatalogStatus::default)
    }

    fn from_discovered(store_name: &str, entry: CatalogEntry) -> Self {
        ModelCatalog::new(
            store_name,
            ModelCatalogSpec {
                entry,
                provider: None,
                model_id: None,
            },
        )
    }

    fn discovered_spec_value(entry: &CatalogEntry) -> serde_json::Value {
        serde_json::to_value(ModelCatalogSpec {
            entry: entry.clone(),
            provider: None,
            model_id: None,
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_entry_serializes_with_wire_names() {
        let entry = CatalogEntry {
            name: "filesys".to_string(),
            version: "1.2.3".to_string(),
            publisher_metadata: Some(serde_json::json!({"team": "infra"})),
            ..Default::default()
        };
        let value = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(value["name"], "filesys");
        assert_eq!(value["publisherMetadata"]["team"], "infra");
        assert!(value.get("publisher_metadata").is_none());
    }

    #[test]
    fn spec_flattens_entry_fields_to_top_level() {
        let spec = MCPServerCatalogSpec {
            entry: CatalogEntry {
                name: "filesys".to_string(),
                version: "1.2.3".to_string(),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["name"], "filesys");
        assert!(value.get("entry").is_none());
    }

    #[test]
    fn agent_spec_round_trips_references() {
        let raw = serde_json::json!({
            "name": "planner",
            "version": "0.3.0",
            "models": ["gpt-large"],
            "skills": ["summarize"],
        });
        let spec: AgentCatalogSpec = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(spec.entry.name, "planner");
        assert_eq!(spec.models, vec!["gpt-large"]);
        assert_eq!(spec.skills, vec!["summarize"]);
    }

    #[test]
    fn status_defaults_are_quiet_on_the_wire() {
        let status = CatalogStatus::default();
        let value = serde_json::to_value(&status).expect("serialize");
        assert_eq!(value, serde_json::json!({"isLatest": false}));
    }
}
