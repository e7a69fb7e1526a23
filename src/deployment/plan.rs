use kube::api::{DynamicObject, ResourceExt};

use crate::crd::ManagedResource;

/// The writes one reconcile owes the target cluster: objects to apply
/// (creates then updates, in translator order) and stale objects to
/// delete.
#[derive(Debug, Default)]
pub struct DeployPlan {
    pub creates: Vec<DynamicObject>,
    pub updates: Vec<DynamicObject>,
    pub deletes: Vec<ManagedResource>,
}

impl DeployPlan {
    pub fn is_noop(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Managed-resource triple for a translated object
pub fn managed_ref(obj: &DynamicObject) -> ManagedResource {
    ManagedResource {
        kind: obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default(),
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
    }
}

/// The sorted managed set a desired object list projects to
pub fn managed_set(desired: &[DynamicObject]) -> Vec<ManagedResource> {
    let mut set: Vec<ManagedResource> = desired.iter().map(managed_ref).collect();
    set.sort();
    set.dedup();
    set
}

/// Splits the desired objects against the last observed managed set:
/// desired-not-observed are creates, desired-and-observed are updates,
/// observed-not-desired are deletes. Execution order is creates, updates,
/// deletes.
pub fn plan_deploy(desired: &[DynamicObject], observed: &[ManagedResource]) -> DeployPlan {
    let mut plan = DeployPlan::default();

    for obj in desired {
        let managed = managed_ref(obj);
        if observed.contains(&managed) {
            plan.updates.push(obj.clone());
        } else {
            plan.creates.push(obj.clone());
        }
    }

    let desired_set = managed_set(desired);
    for managed in observed {
        if !desired_set.contains(managed) {
            plan.deletes.push(managed.clone());
        }
    }

    plan
}
