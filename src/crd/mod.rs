pub mod catalog;
pub mod deployment;
pub mod discovery;

pub use catalog::{
    AgentCatalog, AgentCatalogSpec, CatalogEntry, CatalogKind, CatalogStatus, DeploymentRef,
    MCPServerCatalog, MCPServerCatalogSpec, ModelCatalog, ModelCatalogSpec, PackageRef,
    RemoteEndpoint, Repository, SkillCatalog, SkillCatalogSpec, UsedByRef,
};
pub use deployment::{
    DeploymentPhase, ManagedResource, RegistryDeployment, RegistryDeploymentSpec,
    RegistryDeploymentStatus, ResourceType, RuntimeType,
};
pub use discovery::{
    ClusterRef, DiscoveredResources, DiscoveryConfig, DiscoveryConfigSpec, DiscoveryConfigStatus,
    EnvironmentSpec, EnvironmentStatus, KubeconfigRef, WorkloadIdentityRef,
};

/// API group all registry CRDs live under
pub const API_GROUP: &str = "agentregistry.dev";
pub const API_VERSION: &str = "v1alpha1";

// Canonical labels - part of the wire contract with collaborators
pub const LABEL_NAME: &str = "agentregistry.dev/name";
pub const LABEL_VERSION: &str = "agentregistry.dev/version";
pub const LABEL_DISCOVERED: &str = "agentregistry.dev/discovered";
pub const LABEL_RESOURCE_SOURCE: &str = "agentregistry.dev/resource-source";
pub const LABEL_ENVIRONMENT: &str = "agentregistry.dev/environment";
/// Live workloads advertise themselves to discovery with this label; the
/// value names the catalog kind they project into.
pub const LABEL_COMPONENT: &str = "agentregistry.dev/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Field manager identity for server-side apply and the managed-by value
pub const MANAGER: &str = "agentregistry-controller";

pub const ANNOTATION_TRIGGER_DISCOVERY: &str = "agentregistry.dev/trigger-discovery";
pub const ANNOTATION_CONFIG_HASH: &str = "agentregistry.dev/config-hash";

pub const DEPLOYMENT_FINALIZER: &str = "agentregistry.dev/deployment-protection";

const MAX_STORE_NAME: usize = 63;

/// Lowercases `raw` and maps every run of characters outside `[a-z0-9]` to a
/// single `-`, trimming leading and trailing dashes. The result is a valid
/// DNS-1123 label fragment (possibly empty if `raw` carried nothing usable).
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            out.push(c);
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Deterministic store-name for a catalog record: `sanitize(name) + "-" +
/// sanitize(version)`, truncated to the DNS-1123 label limit. Two records
/// with the same (name, version) map to the same store-name, so they cannot
/// coexist.
pub fn store_name(name: &str, version: &str) -> String {
    let mut out = format!("{}-{}", sanitize(name), sanitize(version));
    if out.len() > MAX_STORE_NAME {
        out.truncate(MAX_STORE_NAME);
        while out.ends_with('-') {
            out.pop();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("filesys", "filesys")]
    #[case("FileSys", "filesys")]
    #[case("file_sys.v2", "file-sys-v2")]
    #[case("--weird--", "weird")]
    #[case("a b  c", "a-b-c")]
    #[case("@scope/pkg", "scope-pkg")]
    fn sanitize_produces_dns_labels(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize(raw), expected);
    }

    #[test]
    fn store_name_encodes_name_and_version() {
        assert_eq!(store_name("filesys", "1.2.3"), "filesys-1-2-3");
        assert_eq!(store_name("My Tool", "2.0.0-rc.1"), "my-tool-2-0-0-rc-1");
    }

    #[test]
    fn store_name_is_deterministic() {
        assert_eq!(store_name("tool", "1.0.0"), store_name("tool", "1.0.0"));
        assert_ne!(store_name("tool", "1.0.0"), store_name("tool", "1.0.1"));
    }

    #[test]
    fn store_name_respects_label_length_limit() {
        let long = "x".repeat(100);
        let name = store_name(&long, "1.0.0");
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }
}
