use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{
    api::{Api, PostParams, ResourceExt},
    client::Client,
};
use semver::Version;

use crate::catalog::election::election_updates;
use crate::catalog::usage::{used_by, UsageTarget};
use crate::crd::{store_name, AgentCatalog, CatalogKind, CatalogStatus, UsedByRef};
use crate::error::{AppError, AppResult, ErrorCategory};
use crate::index::{FieldIndex, INDEX_CATALOG_NAME};
use crate::kubernetes::api::{retry_on_conflict, with_timeout, LOCAL_WRITE_TIMEOUT};
use crate::kubernetes::conditions::{
    build_condition, find_condition, set_condition, ConditionStatus, CONDITION_PUBLISHED,
    CONDITION_READY,
};
use crate::kubernetes::BackoffTracker;
use crate::metrics;

/// Context shared by one catalog kind's workers
pub struct CatalogContext<K: CatalogKind> {
    pub client: Client,
    pub index: Arc<FieldIndex<K>>,
    /// Agent cache for usage back-reference projection; read-only
    pub agents: Arc<FieldIndex<AgentCatalog>>,
    pub backoff: BackoffTracker,
}

/// Which usage back-reference this kind receives, if any
fn usage_target<K: CatalogKind>() -> Option<UsageTarget> {
    match K::KIND {
        "ModelCatalog" => Some(UsageTarget::Model),
        "SkillCatalog" => Some(UsageTarget::Skill),
        _ => None,
    }
}

/// Checks the record shape invariants. A violation is surfaced as a
/// Ready=False condition and not retried until the record changes.
fn validate<K: CatalogKind>(record: &K) -> Option<(&'static str, String)> {
    let entry = record.entry();
    if entry.name.is_empty() || entry.version.is_empty() {
        return Some((
            "MissingNameOrVersion",
            "spec.name and spec.version are required".to_string(),
        ));
    }

    let expected = store_name(&entry.name, &entry.version);
    if record.name_any() != expected {
        return Some((
            "NameVersionImmutable",
            format!(
                "record {} does not match its spec; expected store-name {} for ({}, {})",
                record.name_any(),
                expected,
                entry.name,
                entry.version
            ),
        ));
    }

    if K::SEMVER_VERSIONED && Version::parse(&entry.version).is_err() {
        return Some((
            "InvalidVersion",
            format!("spec.version {:?} is not a semver version", entry.version),
        ));
    }

    None
}

/// Publication stamp needed for this status, if any: Some(true) when the
/// record just became published, Some(false) when it just became
/// unpublished.
fn publication_flip(status: &CatalogStatus) -> Option<bool> {
    let published = status.published.unwrap_or(false);
    let condition_says = find_condition(&status.conditions, CONDITION_PUBLISHED)
        .map(|c| c.status == "True")
        .unwrap_or(false);
    if published == condition_says {
        None
    } else {
        Some(published)
    }
}

/// Read-modify-replace of a record's status under optimistic concurrency.
/// The closure returns false to skip the write; NotFound means the record
/// was deleted mid-flight and is treated as done.
async fn update_status<K, F>(api: &Api<K>, name: &str, mutate: F) -> AppResult<()>
where
    K: CatalogKind,
    F: Fn(&mut K) -> bool,
{
    let mutate = &mutate;
    with_timeout(
        LOCAL_WRITE_TIMEOUT,
        "catalog status update",
        retry_on_conflict(|| async move {
            let mut fresh = match api.get(name).await {
                Ok(obj) => obj,
                Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
                Err(e) => return Err(AppError::Kubernetes(e)),
            };
            if !mutate(&mut fresh) {
                return Ok(());
            }
            let data = serde_json::to_vec(&fresh)?;
            api.replace_status(name, &PostParams::default(), data)
                .await
                .map_err(AppError::Kubernetes)?;
            Ok(())
        }),
    )
    .await
}

async fn reconcile<K: CatalogKind>(
    obj: Arc<K>,
    ctx: Arc<CatalogContext<K>>,
) -> Result<Action, AppError> {
    let start = Instant::now();
    let namespace = obj.namespace().ok_or_else(|| {
        AppError::InvalidInput(format!("{} {} has no namespace", K::KIND, obj.name_any()))
    })?;
    let name = obj.name_any();

    log::debug!("Reconciling {} {}/{}", K::KIND, namespace, name);

    // Deleted records fall out of the cache; survivors are re-enqueued by
    // the group mapper and re-elect there.
    let current = match ctx.index.get(&namespace, &name) {
        Some(current) => current,
        None => return Ok(Action::await_change()),
    };

    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    if let Some((reason, message)) = validate::<K>(current.as_ref()) {
        log::warn!("{} {}/{} rejected: {}", K::KIND, namespace, name, message);
        update_status(&api, &name, |record| {
            let condition = build_condition(
                record,
                record.status().map(|s| s.conditions.as_slice()),
                message.clone(),
                reason.to_string(),
                ConditionStatus::False,
                CONDITION_READY,
            );
            let status = record.status_mut();
            let before = serde_json::to_value(&*status).unwrap_or_default();
            set_condition(&mut status.conditions, condition);
            serde_json::to_value(&*status).unwrap_or_default() != before
        })
        .await?;
        metrics::get().observe_reconcile(K::KIND, "validation", start.elapsed().as_secs_f64());
        // no requeue: the record re-fires when the user edits it
        return Ok(Action::await_change());
    }

    // Latest election across the version group. Losers are written before
    // the winner so no observer sees two latest records.
    let group: Vec<Arc<K>> = ctx
        .index
        .list_by(INDEX_CATALOG_NAME, &current.entry().name)?
        .into_iter()
        .filter(|peer| peer.namespace().as_deref() == Some(namespace.as_str()))
        .collect();

    for (store, desired) in election_updates(&group) {
        update_status(&api, &store, |record| {
            let status = record.status_mut();
            if status.is_latest == desired {
                return false;
            }
            status.is_latest = desired;
            true
        })
        .await?;
    }

    // Publication stamp, usage back-references and the Ready condition land
    // in one status write for the record at hand.
    let usage: Option<Vec<UsedByRef>> = if K::TRACKS_USAGE {
        usage_target::<K>().map(|target| used_by(&ctx.agents.all(), target, &current.entry().name))
    } else {
        None
    };

    update_status(&api, &name, |record| {
        let mut changed = false;

        if K::TRACKS_PUBLICATION {
            if let Some(published_now) = record.status().and_then(publication_flip) {
                let (cond_status, reason, message) = if published_now {
                    (
                        ConditionStatus::True,
                        "Published",
                        "record is visible to catalog readers".to_string(),
                    )
                } else {
                    (
                        ConditionStatus::False,
                        "Unpublished",
                        "record is hidden from non-admin readers".to_string(),
                    )
                };
                let condition = build_condition(
                    record,
                    record.status().map(|s| s.conditions.as_slice()),
                    message,
                    reason.to_string(),
                    cond_status,
                    CONDITION_PUBLISHED,
                );
                let status = record.status_mut();
                if published_now && status.published_at.is_none() {
                    status.published_at =
                        Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                            chrono::Utc::now(),
                        ));
                }
                set_condition(&mut status.conditions, condition);
                changed = true;
            }
        }

        if let Some(computed) = &usage {
            let status = record.status_mut();
            if &status.used_by != computed {
                status.used_by = computed.clone();
                changed = true;
            }
        }

        let ready = build_condition(
            record,
            record.status().map(|s| s.conditions.as_slice()),
            "reconciled".to_string(),
            "Reconciled".to_string(),
            ConditionStatus::True,
            CONDITION_READY,
        );
        let already_ready = record
            .status()
            .and_then(|s| find_condition(&s.conditions, CONDITION_READY))
            .map(|c| {
                c.status == ready.status
                    && c.reason == ready.reason
                    && c.observed_generation == ready.observed_generation
            })
            .unwrap_or(false);
        if !already_ready {
            set_condition(&mut record.status_mut().conditions, ready);
            changed = true;
        }

        changed
    })
    .await?;

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    metrics::get().observe_reconcile(K::KIND, "ok", start.elapsed().as_secs_f64());
    Ok(Action::await_change())
}

fn error_policy<K: CatalogKind>(
    obj: Arc<K>,
    error: &AppError,
    ctx: Arc<CatalogContext<K>>,
) -> Action {
    let key = format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );
    let category = error.category();
    log::warn!("{} {} reconcile failed ({}): {}", K::KIND, key, category.as_str(), error);
    metrics::get().observe_reconcile(K::KIND, category.as_str(), 0.0);

    match category {
        // conflicts re-read and retry immediately, without backoff
        ErrorCategory::Conflict => Action::requeue(Duration::ZERO),
        // wait for a user edit; the long requeue is a safety net
        ErrorCategory::Validation | ErrorCategory::Fatal => {
            Action::requeue(Duration::from_secs(3600))
        }
        _ => Action::requeue(ctx.backoff.next_delay(&key)),
    }
}

/// Runs the controller for one catalog kind until shutdown. Changes fan out
/// to the whole version group, and agent changes fan out to the models and
/// skills they reference.
pub async fn run_catalog_controller<K: CatalogKind>(ctx: Arc<CatalogContext<K>>) {
    let api: Api<K> = Api::all(ctx.client.clone());

    let group_index = ctx.index.clone();
    let group_mapper = move |peer: K| -> Vec<ObjectRef<K>> {
        let namespace = peer.namespace();
        group_index
            .list_by(INDEX_CATALOG_NAME, &peer.entry().name)
            .unwrap_or_default()
            .into_iter()
            .filter(|member| member.namespace() == namespace)
            .filter_map(|member| {
                member
                    .namespace()
                    .map(|ns| ObjectRef::new(&member.name_any()).within(&ns))
            })
            .collect()
    };

    let controller = Controller::new(api, watcher::Config::default())
        .watches(
            Api::<K>::all(ctx.client.clone()),
            watcher::Config::default(),
            group_mapper,
        )
        .shutdown_on_signal();

    let controller = if K::TRACKS_USAGE {
        let usage_index = ctx.index.clone();
        let usage_mapper = move |agent: AgentCatalog| -> Vec<ObjectRef<K>> {
            let referenced = match usage_target::<K>() {
                Some(UsageTarget::Model) => agent.spec.models.clone(),
                Some(UsageTarget::Skill) => agent.spec.skills.clone(),
                None => Vec::new(),
            };
            referenced
                .iter()
                .flat_map(|name| {
                    usage_index
                        .list_by(INDEX_CATALOG_NAME, name)
                        .unwrap_or_default()
                })
                .filter_map(|record| {
                    record
                        .namespace()
                        .map(|ns| ObjectRef::new(&record.name_any()).within(&ns))
                })
                .collect()
        };
        controller.watches(
            Api::<AgentCatalog>::all(ctx.client.clone()),
            watcher::Config::default(),
            usage_mapper,
        )
    } else {
        controller
    };

    log::info!("Starting {} controller", K::KIND);

    controller
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => log::debug!("Reconciliation completed: {:?}", obj),
                Err(e) => log::debug!("Reconciliation error: {:?}", e),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CatalogEntry, MCPServerCatalog, ModelCatalog};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

    fn server(store: &str, name: &str, version: &str) -> MCPServerCatalog {
        MCPServerCatalog::from_discovered(
            store,
            CatalogEntry {
                name: name.to_string(),
                version: version.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn well_formed_records_validate() {
        let obj = server("tool-1-0-0", "tool", "1.0.0");
        assert!(validate(&obj).is_none());
    }

    #[test]
    fn store_name_mismatch_is_immutability_violation() {
        // a spec edit after create leaves the store-name stale
        let obj = server("tool-1-0-0", "tool", "2.0.0");
        let (reason, _) = validate(&obj).expect("rejected");
        assert_eq!(reason, "NameVersionImmutable");
    }

    #[test]
    fn bad_semver_is_rejected_for_semver_kinds() {
        let obj = server("tool-latest", "tool", "latest");
        let (reason, _) = validate(&obj).expect("rejected");
        assert_eq!(reason, "InvalidVersion");
    }

    #[test]
    fn models_accept_non_semver_tags() {
        let obj = ModelCatalog::from_discovered(
            "gpt-large-2025",
            CatalogEntry {
                name: "gpt-large".to_string(),
                version: "2025".to_string(),
                ..Default::default()
            },
        );
        assert!(validate(&obj).is_none());
    }

    fn published_condition(value: &str) -> Condition {
        Condition {
            type_: CONDITION_PUBLISHED.to_string(),
            status: value.to_string(),
            reason: "Published".to_string(),
            message: String::new(),
            observed_generation: None,
            last_transition_time: Time(chrono::Utc::now()),
        }
    }

    #[test]
    fn publication_flip_detects_transitions_only() {
        let mut status = CatalogStatus {
            published: Some(true),
            ..Default::default()
        };
        assert_eq!(publication_flip(&status), Some(true));

        status.conditions = vec![published_condition("True")];
        assert_eq!(publication_flip(&status), None);

        status.published = Some(false);
        assert_eq!(publication_flip(&status), Some(false));

        status.conditions = vec![published_condition("False")];
        assert_eq!(publication_flip(&status), None);
    }
}
