use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
    Resource,
};

use crate::clients::ClientFactory;
use crate::config::Settings;
use crate::crd::{
    AgentCatalog, CatalogEntry, CatalogKind, DeploymentPhase, DeploymentRef, DiscoveryConfig,
    MCPServerCatalog, ManagedResource, RegistryDeployment, ResourceType, DEPLOYMENT_FINALIZER,
};
use crate::deployment::plan::{managed_set, plan_deploy};
use crate::deployment::translator::translate;
use crate::error::{AppError, AppResult, ErrorCategory};
use crate::index::{FieldIndex, INDEX_CATALOG_NAME, INDEX_DEPLOYMENT_RESOURCE_NAME};
use crate::kubernetes::api::{
    apply, delete_managed_resource, retry_on_conflict, with_timeout, LOCAL_WRITE_TIMEOUT,
    REMOTE_CALL_TIMEOUT,
};
use crate::kubernetes::BackoffTracker;
use crate::metrics;

const CATALOG_MISSING_REQUEUE: Duration = Duration::from_secs(300);
const READINESS_REQUEUE: Duration = Duration::from_secs(60);

/// Context shared by the deployment workers
pub struct DeploymentContext {
    pub client: Client,
    pub factory: Arc<ClientFactory>,
    pub settings: Arc<Settings>,
    pub mcp_servers: Arc<FieldIndex<MCPServerCatalog>>,
    pub agents: Arc<FieldIndex<AgentCatalog>>,
    pub deployments: Arc<FieldIndex<RegistryDeployment>>,
    pub backoff: BackoffTracker,
}

/// The catalog record a deployment references, with its store location for
/// the status back-link.
struct ResolvedCatalog {
    entry: CatalogEntry,
    namespace: String,
    name: String,
}

fn resolve_catalog(
    ctx: &DeploymentContext,
    rd: &RegistryDeployment,
) -> AppResult<Option<ResolvedCatalog>> {
    fn pick<K: CatalogKind>(
        index: &FieldIndex<K>,
        resource_name: &str,
        version: &str,
    ) -> AppResult<Option<ResolvedCatalog>> {
        Ok(index
            .list_by(INDEX_CATALOG_NAME, resource_name)?
            .into_iter()
            .find(|record| record.entry().version == version)
            .map(|record| ResolvedCatalog {
                entry: record.entry().clone(),
                namespace: record.namespace().unwrap_or_default(),
                name: record.name_any(),
            }))
    }

    match rd.spec.resource_type {
        ResourceType::Mcp => pick(
            &ctx.mcp_servers,
            &rd.spec.resource_name,
            &rd.spec.version,
        ),
        ResourceType::Agent => pick(&ctx.agents, &rd.spec.resource_name, &rd.spec.version),
    }
}

/// Observed phase of the primary workload object. Failed only on a
/// terminal rollout error; everything short of available is Pending.
fn derive_phase(workload: Option<&Deployment>) -> (DeploymentPhase, String) {
    let Some(workload) = workload else {
        return (
            DeploymentPhase::Pending,
            "workload not yet observed".to_string(),
        );
    };

    let conditions = workload
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref());

    if let Some(conditions) = conditions {
        for condition in conditions {
            let terminal_rollout = condition.type_ == "Progressing"
                && condition.status == "False"
                && condition.reason.as_deref() == Some("ProgressDeadlineExceeded");
            let replica_failure =
                condition.type_ == "ReplicaFailure" && condition.status == "True";
            if terminal_rollout || replica_failure {
                return (
                    DeploymentPhase::Failed,
                    condition
                        .message
                        .clone()
                        .unwrap_or_else(|| "workload rollout failed".to_string()),
                );
            }
        }
    }

    let available = workload
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available >= 1 {
        (DeploymentPhase::Running, "workload is ready".to_string())
    } else {
        (
            DeploymentPhase::Pending,
            "waiting for workload availability".to_string(),
        )
    }
}

/// Where this deployment's workload objects go: the local cluster, or the
/// first connected deploy-enabled environment when the spec prefers
/// remote.
async fn target_client(ctx: &DeploymentContext, rd: &RegistryDeployment) -> AppResult<Client> {
    if !rd.spec.prefer_remote {
        return Ok(ctx.client.clone());
    }

    let configs: Api<DiscoveryConfig> = Api::all(ctx.client.clone());
    let list = configs
        .list(&Default::default())
        .await
        .map_err(AppError::Kubernetes)?;

    for dc in &list.items {
        let connected = |name: &str| {
            dc.status
                .as_ref()
                .map(|s| {
                    s.environments
                        .iter()
                        .any(|e| e.name == name && e.connected)
                })
                .unwrap_or(false)
        };
        for env in &dc.spec.environments {
            if !env.deploy_enabled || !connected(&env.name) {
                continue;
            }
            match ctx.factory.client_for(env).await {
                Ok(handle) => {
                    log::debug!(
                        "Deployment {} routed to environment {}",
                        rd.name_any(),
                        env.name
                    );
                    return Ok(handle.client);
                }
                Err(e) => {
                    log::warn!(
                        "Environment {} unusable for deployment {}: {}",
                        env.name,
                        rd.name_any(),
                        e
                    );
                }
            }
        }
    }

    log::warn!(
        "Deployment {} prefers remote but no deploy-enabled environment is connected, using local cluster",
        rd.name_any()
    );
    Ok(ctx.client.clone())
}

/// Read-modify-replace of the deployment status. The phase transition
/// guard is enforced here: an illegal transition keeps the current phase.
async fn update_status<F>(
    api: &Api<RegistryDeployment>,
    name: &str,
    mutate: F,
) -> AppResult<()>
where
    F: Fn(&mut crate::crd::RegistryDeploymentStatus) -> bool,
{
    let mutate = &mutate;
    with_timeout(
        LOCAL_WRITE_TIMEOUT,
        "deployment status update",
        retry_on_conflict(|| async move {
            let mut fresh = match api.get(name).await {
                Ok(obj) => obj,
                Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
                Err(e) => return Err(AppError::Kubernetes(e)),
            };
            let previous_phase = fresh.phase();
            let mut status = fresh.status.clone().unwrap_or_default();
            if !mutate(&mut status) {
                return Ok(());
            }
            if !previous_phase.can_transition_to(status.phase) {
                log::warn!(
                    "Deployment {} phase may not move {} -> {}, keeping {}",
                    name,
                    previous_phase,
                    status.phase,
                    previous_phase
                );
                status.phase = previous_phase;
            }
            status.updated_at = Some(Time(Utc::now()));
            fresh.status = Some(status);
            let data = serde_json::to_vec(&fresh)?;
            api.replace_status(name, &PostParams::default(), data)
                .await
                .map_err(AppError::Kubernetes)?;
            Ok(())
        }),
    )
    .await
}

async fn ensure_finalizer(
    api: &Api<RegistryDeployment>,
    rd: &RegistryDeployment,
) -> AppResult<bool> {
    if rd
        .finalizers()
        .iter()
        .any(|f| f == DEPLOYMENT_FINALIZER)
    {
        return Ok(false);
    }

    let mut finalizers = rd.finalizers().to_vec();
    finalizers.push(DEPLOYMENT_FINALIZER.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&rd.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(AppError::Kubernetes)?;
    Ok(true)
}

async fn remove_finalizer(api: &Api<RegistryDeployment>, name: &str) -> AppResult<()> {
    retry_on_conflict(|| async move {
        let fresh = match api.get(name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(AppError::Kubernetes(e)),
        };
        let finalizers: Vec<String> = fresh
            .finalizers()
            .iter()
            .filter(|f| *f != DEPLOYMENT_FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(AppError::Kubernetes)?;
        Ok(())
    })
    .await
}

/// Advisory pointer from the deployment back onto the catalog record.
/// Best-effort: a failure is logged and carried by the next reconcile.
async fn write_back_reference(
    ctx: &DeploymentContext,
    resolved: &ResolvedCatalog,
    resource_type: ResourceType,
    reference: DeploymentRef,
) {
    async fn write<K: CatalogKind>(
        client: &Client,
        namespace: &str,
        name: &str,
        reference: DeploymentRef,
    ) -> AppResult<()> {
        let api: Api<K> = Api::namespaced(client.clone(), namespace);
        let mut fresh = match api.get(name).await {
            Ok(obj) => obj,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(AppError::Kubernetes(e)),
        };
        let unchanged = fresh
            .status()
            .and_then(|s| s.deployment.as_ref())
            .map(|current| {
                current.name == reference.name
                    && current.namespace == reference.namespace
                    && current.ready == reference.ready
                    && current.message == reference.message
            })
            .unwrap_or(false);
        if unchanged {
            return Ok(());
        }
        fresh.status_mut().deployment = Some(reference);
        let data = serde_json::to_vec(&fresh)?;
        api.replace_status(name, &PostParams::default(), data)
            .await
            .map_err(AppError::Kubernetes)?;
        Ok(())
    }

    let result = match resource_type {
        ResourceType::Mcp => {
            write::<MCPServerCatalog>(
                &ctx.client,
                &resolved.namespace,
                &resolved.name,
                reference,
            )
            .await
        }
        ResourceType::Agent => {
            write::<AgentCatalog>(&ctx.client, &resolved.namespace, &resolved.name, reference)
                .await
        }
    };

    if let Err(e) = result {
        log::warn!(
            "Back-reference write to {} {}/{} failed: {}",
            resource_type,
            resolved.namespace,
            resolved.name,
            e
        );
    }
}

/// Finalizer path: reclaim every tracked workload object, then release the
/// record. NotFound deletes count as done.
async fn finalize(
    ctx: &DeploymentContext,
    rd: &RegistryDeployment,
    api: &Api<RegistryDeployment>,
) -> Result<Action, AppError> {
    let name = rd.name_any();
    if !rd
        .finalizers()
        .iter()
        .any(|f| f == DEPLOYMENT_FINALIZER)
    {
        // nothing tracked under our finalizer; let the store collect it
        return Ok(Action::await_change());
    }

    update_status(api, &name, |status| {
        if status.phase == DeploymentPhase::Terminating {
            return false;
        }
        status.phase = DeploymentPhase::Terminating;
        status.message = Some("reclaiming managed resources".to_string());
        true
    })
    .await?;

    let observed = rd
        .status
        .as_ref()
        .map(|s| s.managed_resources.clone())
        .unwrap_or_default();

    let target = target_client(ctx, rd).await?;
    let mut remaining: Vec<ManagedResource> = Vec::new();
    for managed in &observed {
        let deleted = with_timeout(REMOTE_CALL_TIMEOUT, "managed resource delete", async {
            delete_managed_resource(&target, managed).await
        })
        .await;
        match deleted {
            Ok(()) => {
                metrics::get()
                    .deploy_operations
                    .add(1, &[opentelemetry::KeyValue::new("op", "delete")]);
            }
            Err(e) => {
                log::warn!(
                    "Reclaiming {} {}/{} failed: {}",
                    managed.kind,
                    managed.namespace,
                    managed.name,
                    e
                );
                remaining.push(managed.clone());
            }
        }
    }

    update_status(api, &name, |status| {
        if status.managed_resources == remaining {
            return false;
        }
        status.managed_resources = remaining.clone();
        true
    })
    .await?;

    if remaining.is_empty() {
        remove_finalizer(api, &name).await?;
        log::info!("Deployment {} released", name);
        return Ok(Action::await_change());
    }

    // some objects resisted deletion; try again shortly
    Ok(Action::requeue(Duration::from_secs(5)))
}

async fn reconcile_inner(
    rd: Arc<RegistryDeployment>,
    ctx: Arc<DeploymentContext>,
) -> Result<Action, AppError> {
    let namespace = rd.namespace().unwrap_or_else(|| "default".to_string());
    let name = rd.name_any();
    let api: Api<RegistryDeployment> = Api::namespaced(ctx.client.clone(), &namespace);

    log::debug!("Reconciling RegistryDeployment {}/{}", namespace, name);

    if rd.meta().deletion_timestamp.is_some() {
        return finalize(&ctx, &rd, &api).await;
    }

    // finalizer lands before any workload object exists, so a crash between
    // the two cannot leak
    if ensure_finalizer(&api, &rd).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }

    let resolved = match resolve_catalog(&ctx, &rd)? {
        Some(resolved) => resolved,
        None => {
            log::warn!(
                "Deployment {}/{} references missing catalog record {}@{}",
                namespace,
                name,
                rd.spec.resource_name,
                rd.spec.version
            );
            update_status(&api, &name, |status| {
                let message = format!(
                    "CatalogNotFound: no {} record for {}@{}",
                    rd.spec.resource_type, rd.spec.resource_name, rd.spec.version
                );
                if status.phase == DeploymentPhase::Failed
                    && status.message.as_deref() == Some(message.as_str())
                {
                    return false;
                }
                status.phase = DeploymentPhase::Failed;
                status.message = Some(message);
                true
            })
            .await?;
            return Ok(Action::requeue(CATALOG_MISSING_REQUEUE));
        }
    };

    let desired = match translate(&resolved.entry, &rd) {
        Ok(desired) => desired,
        Err(e) => {
            // untranslatable spec: surface and wait for an edit
            update_status(&api, &name, |status| {
                let message = format!("Untranslatable: {}", e);
                if status.message.as_deref() == Some(message.as_str()) {
                    return false;
                }
                status.phase = DeploymentPhase::Failed;
                status.message = Some(message);
                true
            })
            .await?;
            return Ok(Action::requeue(CATALOG_MISSING_REQUEUE));
        }
    };

    let observed = rd
        .status
        .as_ref()
        .map(|s| s.managed_resources.clone())
        .unwrap_or_default();
    let plan = plan_deploy(&desired, &observed);

    if !plan.is_noop() {
        log::info!(
            "Deployment {}/{}: {} creates, {} updates, {} deletes",
            namespace,
            name,
            plan.creates.len(),
            plan.updates.len(),
            plan.deletes.len()
        );
    }

    let target = target_client(&ctx, &rd).await?;
    let target_namespace = rd
        .target_namespace()
        .unwrap_or_else(|| ctx.settings.pod_namespace.clone());

    let mut op_error: Option<AppError> = None;
    for (op, obj) in plan
        .creates
        .iter()
        .map(|o| ("create", o))
        .chain(plan.updates.iter().map(|o| ("update", o)))
    {
        let obj_namespace = obj
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| target_namespace.clone());
        let target = &target;
        let obj_namespace = &obj_namespace;
        let result = with_timeout(REMOTE_CALL_TIMEOUT, "workload apply", async {
            retry_on_conflict(|| async move { apply(target, obj_namespace, obj.clone()).await })
                .await
        })
        .await;
        match result {
            Ok(_) => {
                metrics::get()
                    .deploy_operations
                    .add(1, &[opentelemetry::KeyValue::new("op", op)]);
            }
            Err(e) => {
                // the remainder of the batch is carried by the next
                // reconcile
                op_error = Some(e);
                break;
            }
        }
    }

    let mut failed_deletes: Vec<ManagedResource> = Vec::new();
    if op_error.is_none() {
        for managed in &plan.deletes {
            let result = with_timeout(REMOTE_CALL_TIMEOUT, "workload delete", async {
                delete_managed_resource(&target, managed).await
            })
            .await;
            match result {
                Ok(()) => {
                    metrics::get()
                        .deploy_operations
                        .add(1, &[opentelemetry::KeyValue::new("op", "delete")]);
                }
                Err(e) => {
                    failed_deletes.push(managed.clone());
                    op_error = Some(e);
                }
            }
        }
    } else {
        // unexecuted deletes stay tracked until they actually go
        failed_deletes = plan.deletes.clone();
    }

    // anything desired was possibly created even on failure, and anything
    // we failed to delete is still live: track both
    let mut new_managed = managed_set(&desired);
    for managed in failed_deletes {
        if !new_managed.contains(&managed) {
            new_managed.push(managed);
        }
    }
    new_managed.sort();

    let primary: Api<Deployment> = Api::namespaced(target.clone(), &target_namespace);
    let workload = with_timeout(REMOTE_CALL_TIMEOUT, "workload read", async {
        primary.get_opt(&name).await.map_err(AppError::Kubernetes)
    })
    .await?;
    let (phase, phase_message) = derive_phase(workload.as_ref());

    let message = match &op_error {
        Some(e) => format!("plan incomplete: {}", e),
        None => phase_message,
    };

    update_status(&api, &name, |status| {
        let mut changed = false;
        if status.managed_resources != new_managed {
            status.managed_resources = new_managed.clone();
            changed = true;
        }
        if status.phase != phase {
            status.phase = phase;
            changed = true;
        }
        if status.message.as_deref() != Some(message.as_str()) {
            status.message = Some(message.clone());
            changed = true;
        }
        if status.deployed_at.is_none() && !new_managed.is_empty() {
            status.deployed_at = Some(Time(Utc::now()));
            changed = true;
        }
        changed
    })
    .await?;

    write_back_reference(
        &ctx,
        &resolved,
        rd.spec.resource_type,
        DeploymentRef {
            name: name.clone(),
            namespace: namespace.clone(),
            ready: phase == DeploymentPhase::Running,
            message: Some(message.clone()),
            last_checked: Some(Time(Utc::now())),
        },
    )
    .await;

    if let Some(e) = op_error {
        return Err(e);
    }

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    Ok(Action::requeue(READINESS_REQUEUE))
}

async fn reconcile(
    rd: Arc<RegistryDeployment>,
    ctx: Arc<DeploymentContext>,
) -> Result<Action, AppError> {
    let start = Instant::now();
    // a reconcile may not outlive twice its configured budget
    let budget = ctx.settings.deployment_reconcile_timeout * 2;
    let result = with_timeout(budget, "deployment reconcile", async {
        reconcile_inner(rd, ctx.clone()).await
    })
    .await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.category().as_str(),
    };
    metrics::get().observe_reconcile("RegistryDeployment", outcome, start.elapsed().as_secs_f64());
    result
}

fn error_policy(
    rd: Arc<RegistryDeployment>,
    error: &AppError,
    ctx: Arc<DeploymentContext>,
) -> Action {
    let key = format!("{}/{}", rd.namespace().unwrap_or_default(), rd.name_any());
    let category = error.category();
    log::warn!(
        "RegistryDeployment {} reconcile failed ({}): {}",
        key,
        category.as_str(),
        error
    );

    match category {
        ErrorCategory::Conflict => Action::requeue(Duration::ZERO),
        ErrorCategory::Validation | ErrorCategory::Fatal => {
            Action::requeue(Duration::from_secs(3600))
        }
        _ => Action::requeue(ctx.backoff.next_delay(&key)),
    }
}

/// Runs the deployment controller until shutdown. Catalog changes fan out
/// to the deployments that reference them.
pub async fn run_deployment_controller(ctx: Arc<DeploymentContext>) {
    let api: Api<RegistryDeployment> = Api::all(ctx.client.clone());

    let mcp_index = ctx.deployments.clone();
    let mcp_mapper = move |record: MCPServerCatalog| -> Vec<ObjectRef<RegistryDeployment>> {
        mcp_index
            .list_by(INDEX_DEPLOYMENT_RESOURCE_NAME, &record.spec.entry.name)
            .unwrap_or_default()
            .into_iter()
            .filter(|rd| rd.spec.resource_type == ResourceType::Mcp)
            .filter_map(|rd| {
                rd.namespace()
                    .map(|ns| ObjectRef::new(&rd.name_any()).within(&ns))
            })
            .collect()
    };

    let agent_index = ctx.deployments.clone();
    let agent_mapper = move |record: AgentCatalog| -> Vec<ObjectRef<RegistryDeployment>> {
        agent_index
            .list_by(INDEX_DEPLOYMENT_RESOURCE_NAME, &record.spec.entry.name)
            .unwrap_or_default()
            .into_iter()
            .filter(|rd| rd.spec.resource_type == ResourceType::Agent)
            .filter_map(|rd| {
                rd.namespace()
                    .map(|ns| ObjectRef::new(&rd.name_any()).within(&ns))
            })
            .collect()
    };

    log::info!("Starting RegistryDeployment controller");

    Controller::new(api, watcher::Config::default())
        .watches(
            Api::<MCPServerCatalog>::all(ctx.client.clone()),
            watcher::Config::default(),
            mcp_mapper,
        )
        .watches(
            Api::<AgentCatalog>::all(ctx.client.clone()),
            watcher::Config::default(),
            agent_mapper,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
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
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentStatus};

    fn workload(available: i32, conditions: Vec<DeploymentCondition>) -> Deployment {
        Deployment {
            status: Some(DeploymentStatus {
                available_replicas: Some(available),
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str, reason: Option<&str>) -> DeploymentCondition {
        DeploymentCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.map(|r| r.to_string()),
            message: Some("details".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn unobserved_workloads_are_pending() {
        let (phase, _) = derive_phase(None);
        assert_eq!(phase, DeploymentPhase::Pending);
    }

    #[test]
    fn available_workloads_run() {
        let w = workload(1, vec![condition("Available", "True", None)]);
        let (phase, _) = derive_phase(Some(&w));
        assert_eq!(phase, DeploymentPhase::Running);
    }

    #[test]
    fn exceeded_progress_deadline_is_terminal() {
        let w = workload(
            0,
            vec![condition(
                "Progressing",
                "False",
                Some("ProgressDeadlineExceeded"),
            )],
        );
        let (phase, message) = derive_phase(Some(&w));
        assert_eq!(phase, DeploymentPhase::Failed);
        assert_eq!(message, "details");
    }

    #[test]
    fn replica_failure_is_terminal() {
        let w = workload(0, vec![condition("ReplicaFailure", "True", None)]);
        let (phase, _) = derive_phase(Some(&w));
        assert_eq!(phase, DeploymentPhase::Failed);
    }

    #[test]
    fn scaling_up_is_pending() {
        let w = workload(0, vec![condition("Progressing", "True", None)]);
        let (phase, _) = derive_phase(Some(&w));
        assert_eq!(phase, DeploymentPhase::Pending);
    }
}
