use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::client::Client;
use kube::{Resource, ResourceExt};

use crate::crd::{
    CatalogKind, EnvironmentSpec, LABEL_COMPONENT, LABEL_DISCOVERED, LABEL_ENVIRONMENT,
};
use crate::discovery::projection::{discovered_labels, project_deployment, DiscoveredRecord};
use crate::error::{AppError, AppResult};
use crate::kubernetes::api::{retry_on_conflict, with_timeout, REMOTE_CALL_TIMEOUT};

/// Writes one environment sync owes the store for one kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub creates: Vec<String>,
    pub updates: Vec<String>,
    pub deletes: Vec<String>,
    pub unchanged: Vec<String>,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Diffs the projected live set against the currently discovered records.
/// Records are deleted only when their environment label matches
/// `environment`: reclamation never crosses environments. Pure.
pub fn plan_sync(
    desired: &BTreeMap<String, serde_json::Value>,
    existing: &BTreeMap<String, (serde_json::Value, Option<String>)>,
    environment: &str,
) -> SyncPlan {
    let mut plan = SyncPlan::default();

    for (store, spec) in desired {
        match existing.get(store) {
            None => plan.creates.push(store.clone()),
            Some((current_spec, _)) if current_spec != spec => plan.updates.push(store.clone()),
            Some(_) => plan.unchanged.push(store.clone()),
        }
    }

    for (store, (_, env_label)) in existing {
        if desired.contains_key(store) {
            continue;
        }
        if env_label.as_deref() == Some(environment) {
            plan.deletes.push(store.clone());
        }
    }

    plan
}

/// Counters reported into the environment status
#[derive(Clone, Copy, Debug, Default)]
pub struct KindSyncStats {
    pub discovered: u32,
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
}

/// Enumerate the live workloads of one component kind across the
/// environment's namespaces and project them. Translation failures are
/// logged and skipped; a failed list aborts the environment sync.
async fn enumerate_live(
    remote: &Client,
    env: &EnvironmentSpec,
    component: &str,
) -> AppResult<BTreeMap<String, DiscoveredRecord>> {
    let selector = format!("{}={}", LABEL_COMPONENT, component);
    let mut discovered: BTreeMap<String, DiscoveredRecord> = BTreeMap::new();

    for namespace in env.sync_namespaces() {
        let api: Api<Deployment> = Api::namespaced(remote.clone(), &namespace);
        let list = with_timeout(REMOTE_CALL_TIMEOUT, "workload list", async {
            api.list(&ListParams::default().labels(&selector))
                .await
                .map_err(AppError::Kubernetes)
        })
        .await
        .map_err(|e| {
            AppError::Unreachable(format!(
                "listing {} workloads in {}/{}: {}",
                component, env.name, namespace, e
            ))
        })?;

        for live in list.items {
            let live_name = live.name_any();
            match project_deployment(&live) {
                Ok(record) => {
                    if let Some(previous) = discovered.insert(record.store_name.clone(), record) {
                        log::warn!(
                            "Environment {} projects {} twice; keeping the later namespace",
                            env.name,
                            previous.store_name
                        );
                    }
                }
                Err(e) => {
                    log::warn!(
                        "Skipping untranslatable workload {}/{} in {}: {}",
                        namespace,
                        live_name,
                        env.name,
                        e
                    );
                }
            }
        }
    }

    Ok(discovered)
}

/// Sync one catalog kind for one environment: enumerate, project, diff,
/// and write. Returns the counters for the environment status.
pub async fn sync_kind<K: CatalogKind>(
    hub: &Client,
    remote: &Client,
    env: &EnvironmentSpec,
    registry_namespace: &str,
) -> AppResult<KindSyncStats> {
    let discovered = enumerate_live(remote, env, K::COMPONENT).await?;

    let api: Api<K> = Api::namespaced(hub.clone(), registry_namespace);
    let owned_selector = format!(
        "{}=true,{}={}",
        LABEL_DISCOVERED, LABEL_ENVIRONMENT, env.name
    );
    let existing_list = with_timeout(REMOTE_CALL_TIMEOUT, "discovered record list", async {
        api.list(&ListParams::default().labels(&owned_selector))
            .await
            .map_err(AppError::Kubernetes)
    })
    .await?;

    let desired_specs: BTreeMap<String, serde_json::Value> = discovered
        .iter()
        .map(|(store, record)| (store.clone(), K::discovered_spec_value(&record.entry)))
        .collect();
    let existing_specs: BTreeMap<String, (serde_json::Value, Option<String>)> = existing_list
        .items
        .iter()
        .map(|record| {
            let spec = serde_json::to_value(record)
                .ok()
                .and_then(|mut v| v.get_mut("spec").map(serde_json::Value::take))
                .unwrap_or_default();
            let env_label = record.labels().get(LABEL_ENVIRONMENT).cloned();
            (record.name_any(), (spec, env_label))
        })
        .collect();

    let plan = plan_sync(&desired_specs, &existing_specs, &env.name);
    let mut stats = KindSyncStats {
        discovered: discovered.len() as u32,
        ..Default::default()
    };

    if plan.is_noop() {
        log::debug!(
            "Environment {} {} records are settled ({} unchanged)",
            env.name,
            K::KIND,
            plan.unchanged.len()
        );
        return Ok(stats);
    }

    for store in &plan.creates {
        let record = &discovered[store];
        let mut obj = K::from_discovered(store, record.entry.clone());
        obj.meta_mut().namespace = Some(registry_namespace.to_string());
        obj.meta_mut().labels = Some(discovered_labels(env, &record.entry));

        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {
                log::info!("Discovered {} {} from {}", K::KIND, store, env.name);
                stats.created += 1;
            }
            // lost a create race; the next sync will reconcile the spec
            Err(kube::Error::Api(e)) if e.code == 409 => {
                log::debug!("{} {} already exists, leaving for next sync", K::KIND, store);
            }
            Err(e) => {
                log::warn!("Creating {} {} failed: {}", K::KIND, store, e);
            }
        }
    }

    for store in &plan.updates {
        let record = &discovered[store];
        // discovery owns the spec of discovered records; user edits are
        // overwritten here
        let patch = serde_json::json!({
            "metadata": { "labels": discovered_labels(env, &record.entry) },
            "spec": K::discovered_spec_value(&record.entry),
        });
        let api = &api;
        let patch = &patch;
        let result = retry_on_conflict(|| async move {
            api.patch(store, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(AppError::Kubernetes)?;
            Ok(())
        })
        .await;
        match result {
            Ok(()) => {
                log::info!("Refreshed drifted {} {} from {}", K::KIND, store, env.name);
                stats.updated += 1;
            }
            Err(e) => log::warn!("Updating {} {} failed: {}", K::KIND, store, e),
        }
    }

    for store in &plan.deletes {
        match api.delete(store, &DeleteParams::default()).await {
            Ok(_) => {
                log::info!(
                    "Reclaimed orphaned {} {} from {}",
                    K::KIND,
                    store,
                    env.name
                );
                stats.deleted += 1;
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                stats.deleted += 1;
            }
            Err(e) => log::warn!("Reclaiming {} {} failed: {}", K::KIND, store, e),
        }
    }

    log::debug!(
        "Environment {} {}: {} created, {} updated, {} deleted",
        env.name,
        K::KIND,
        stats.created,
        stats.updated,
        stats.deleted
    );

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn desired(entries: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn existing(
        entries: &[(&str, serde_json::Value, &str)],
    ) -> BTreeMap<String, (serde_json::Value, Option<String>)> {
        entries
            .iter()
            .map(|(k, v, env)| (k.to_string(), (v.clone(), Some(env.to_string()))))
            .collect()
    }

    #[test]
    fn missing_records_are_created() {
        let plan = plan_sync(
            &desired(&[("filesys-1-2-3", json!({"name": "filesys"}))]),
            &BTreeMap::new(),
            "prod",
        );
        assert_eq!(plan.creates, vec!["filesys-1-2-3"]);
        assert!(plan.updates.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn drifted_specs_are_updated() {
        let plan = plan_sync(
            &desired(&[("filesys-1-2-3", json!({"name": "filesys", "title": "new"}))]),
            &existing(&[(
                "filesys-1-2-3",
                json!({"name": "filesys", "title": "old"}),
                "prod",
            )]),
            "prod",
        );
        assert_eq!(plan.updates, vec!["filesys-1-2-3"]);
        assert!(plan.creates.is_empty());
    }

    #[test]
    fn a_second_sync_against_an_unchanged_cluster_writes_nothing() {
        let spec = json!({"name": "filesys", "version": "1.2.3"});
        let plan = plan_sync(
            &desired(&[("filesys-1-2-3", spec.clone())]),
            &existing(&[("filesys-1-2-3", spec, "prod")]),
            "prod",
        );
        assert!(plan.is_noop());
        assert_eq!(plan.unchanged, vec!["filesys-1-2-3"]);
    }

    #[test]
    fn orphans_are_reclaimed_only_in_their_own_environment() {
        let plan = plan_sync(
            &BTreeMap::new(),
            &existing(&[
                ("filesys-1-2-3", json!({}), "prod"),
                ("filesys-9-9-9", json!({}), "staging"),
            ]),
            "prod",
        );
        assert_eq!(plan.deletes, vec!["filesys-1-2-3"]);
    }

    #[test]
    fn records_without_an_environment_label_are_never_reclaimed() {
        let mut current = BTreeMap::new();
        current.insert("user-record-1-0-0".to_string(), (json!({}), None));
        let plan = plan_sync(&BTreeMap::new(), &current, "prod");
        assert!(plan.deletes.is_empty());
    }
}
