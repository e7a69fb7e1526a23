use std::sync::Arc;

use itertools::Itertools;
use kube::ResourceExt;

use crate::crd::{AgentCatalog, UsedByRef};

/// What an agent references a target record as
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageTarget {
    Model,
    Skill,
}

/// Projects the usedBy back-reference set for one model or skill name from
/// the live agents: every agent whose spec references `target_name`, as
/// sorted `{kind, namespace, name}` triples. Pure; the reconciler writes
/// the result only when it differs from stored status.
pub fn used_by(
    agents: &[Arc<AgentCatalog>],
    target: UsageTarget,
    target_name: &str,
) -> Vec<UsedByRef> {
    agents
        .iter()
        .filter(|agent| {
            let referenced = match target {
                UsageTarget::Model => &agent.spec.models,
                UsageTarget::Skill => &agent.spec.skills,
            };
            referenced.iter().any(|name| name == target_name)
        })
        .map(|agent| UsedByRef {
            kind: "AgentCatalog".to_string(),
            namespace: agent.namespace().unwrap_or_default(),
            name: agent.name_any(),
        })
        .sorted()
        .dedup()
        .collect()
}
