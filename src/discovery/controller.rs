use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{
    api::{Api, Patch, PatchParams, PostParams, ResourceExt},
    client::Client,
};
use tokio::sync::Mutex;

use crate::clients::ClientFactory;
use crate::config::Settings;
use crate::crd::{
    AgentCatalog, DiscoveredResources, DiscoveryConfig, DiscoveryConfigStatus, EnvironmentSpec,
    EnvironmentStatus, MCPServerCatalog, ModelCatalog, SkillCatalog,
    ANNOTATION_TRIGGER_DISCOVERY,
};
use crate::crd::catalog::CatalogKind;
use crate::discovery::sync::sync_kind;
use crate::error::{AppError, AppResult, ErrorCategory};
use crate::kubernetes::api::{retry_on_conflict, with_timeout, LOCAL_WRITE_TIMEOUT};
use crate::kubernetes::BackoffTracker;
use crate::metrics;

/// Connection state of one environment, for logging and metrics; the
/// persisted status carries the connected flag and error string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EnvPhase {
    Connecting,
    Syncing,
    Idle,
    Disconnected,
}

/// Context shared by the discovery workers
pub struct DiscoveryContext {
    pub client: Client,
    pub factory: Arc<ClientFactory>,
    pub settings: Arc<Settings>,
    pub backoff: BackoffTracker,
    /// One sync runs per environment at a time; ticks landing while a sync
    /// is in flight coalesce into the controller's queued key.
    env_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DiscoveryContext {
    pub fn new(client: Client, factory: Arc<ClientFactory>, settings: Arc<Settings>) -> Self {
        DiscoveryContext {
            client,
            factory,
            settings,
            backoff: BackoffTracker::new(),
            env_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, env_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.env_locks.lock().await;
        locks
            .entry(env_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn disconnected(
    env: &EnvironmentSpec,
    previous: Option<&EnvironmentStatus>,
    error: &AppError,
) -> EnvironmentStatus {
    log::warn!(
        "Environment {}: {:?}: {}",
        env.name,
        EnvPhase::Disconnected,
        error
    );
    EnvironmentStatus {
        name: env.name.clone(),
        connected: false,
        error: Some(error.to_string()),
        // keep the last-known-good view
        last_sync_time: previous.and_then(|p| p.last_sync_time.clone()),
        discovered_resources: previous
            .map(|p| p.discovered_resources)
            .unwrap_or_default(),
    }
}

async fn sync_environment(
    ctx: &DiscoveryContext,
    env: &EnvironmentSpec,
    previous: Option<&EnvironmentStatus>,
) -> EnvironmentStatus {
    if !env.discovery_enabled {
        return EnvironmentStatus {
            name: env.name.clone(),
            connected: false,
            error: None,
            last_sync_time: previous.and_then(|p| p.last_sync_time.clone()),
            discovered_resources: previous
                .map(|p| p.discovered_resources)
                .unwrap_or_default(),
        };
    }

    let lock = ctx.lock_for(&env.name).await;
    let _guard = match lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            // a sync is already in flight; this tick coalesces
            log::debug!("Environment {} sync already running, coalescing", env.name);
            return previous.cloned().unwrap_or_else(|| EnvironmentStatus {
                name: env.name.clone(),
                ..Default::default()
            });
        }
    };

    let mut phase = EnvPhase::Connecting;
    log::debug!("Environment {}: {:?}", env.name, phase);

    let handle = match ctx.factory.client_for(env).await {
        Ok(handle) => handle,
        Err(e) => {
            if e.is_unauthorized() {
                ctx.factory.invalidate(&env.name).await;
            }
            metrics::get()
                .environment_connected
                .with_label_values(&[env.name.as_str()])
                .set(0);
            return disconnected(env, previous, &e);
        }
    };

    if let Err(e) = handle.probe().await {
        ctx.factory.record_probe_failure(&env.name).await;
        if e.is_unauthorized() {
            ctx.factory.invalidate(&env.name).await;
        }
        metrics::get()
            .environment_connected
            .with_label_values(&[env.name.as_str()])
            .set(0);
        return disconnected(env, previous, &e);
    }
    ctx.factory.record_probe_success(&env.name).await;

    phase = EnvPhase::Syncing;
    log::debug!("Environment {}: {:?}", env.name, phase);
    metrics::get().discovery_syncs.add(1, &[]);

    let hub = &ctx.client;
    let remote = &handle.client;
    let registry_ns = &ctx.settings.pod_namespace;
    let mut counts = DiscoveredResources::default();

    let outcome: AppResult<()> = async {
        if env.discovers(MCPServerCatalog::COMPONENT) {
            counts.mcp_servers = sync_kind::<MCPServerCatalog>(hub, remote, env, registry_ns)
                .await?
                .discovered;
        }
        if env.discovers(AgentCatalog::COMPONENT) {
            counts.agents = sync_kind::<AgentCatalog>(hub, remote, env, registry_ns)
                .await?
                .discovered;
        }
        if env.discovers(SkillCatalog::COMPONENT) {
            counts.skills = sync_kind::<SkillCatalog>(hub, remote, env, registry_ns)
                .await?
                .discovered;
        }
        if env.discovers(ModelCatalog::COMPONENT) {
            counts.models = sync_kind::<ModelCatalog>(hub, remote, env, registry_ns)
                .await?
                .discovered;
        }
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        if e.is_unauthorized() {
            ctx.factory.invalidate(&env.name).await;
        }
        metrics::get()
            .environment_connected
            .with_label_values(&[env.name.as_str()])
            .set(0);
        return disconnected(env, previous, &e);
    }

    phase = EnvPhase::Idle;
    log::debug!("Environment {}: {:?}", env.name, phase);

    let m = metrics::get();
    m.environment_connected
        .with_label_values(&[env.name.as_str()])
        .set(1);
    for (kind, count) in [
        ("mcp-server", counts.mcp_servers),
        ("agent", counts.agents),
        ("skill", counts.skills),
        ("model", counts.models),
    ] {
        m.discovered_resources
            .with_label_values(&[env.name.as_str(), kind])
            .set(count as i64);
    }

    EnvironmentStatus {
        name: env.name.clone(),
        connected: true,
        error: None,
        last_sync_time: Some(Time(Utc::now())),
        discovered_resources: counts,
    }
}

async fn reconcile(
    dc: Arc<DiscoveryConfig>,
    ctx: Arc<DiscoveryContext>,
) -> Result<Action, AppError> {
    let start = Instant::now();
    let namespace = dc.namespace().unwrap_or_else(|| "default".to_string());
    let name = dc.name_any();

    log::debug!("Reconciling DiscoveryConfig {}/{}", namespace, name);

    let triggered = dc
        .annotations()
        .contains_key(ANNOTATION_TRIGGER_DISCOVERY);
    if triggered {
        log::info!(
            "DiscoveryConfig {}/{} sync forced by annotation",
            namespace,
            name
        );
    }

    let previous: HashMap<String, EnvironmentStatus> = dc
        .status
        .as_ref()
        .map(|s| {
            s.environments
                .iter()
                .map(|e| (e.name.clone(), e.clone()))
                .collect()
        })
        .unwrap_or_default();

    // environments sync in parallel; each holds its own mutex
    let syncs = dc
        .spec
        .environments
        .iter()
        .map(|env| sync_environment(&ctx, env, previous.get(&env.name)));
    let environments: Vec<EnvironmentStatus> = join_all(syncs).await;

    let status = DiscoveryConfigStatus {
        environments,
        last_sync_time: Some(Time(Utc::now())),
    };

    let api: Api<DiscoveryConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    with_timeout(
        LOCAL_WRITE_TIMEOUT,
        "discovery status update",
        retry_on_conflict(|| {
            let status = status.clone();
            let api = api.clone();
            let name = name.clone();
            async move {
                let mut fresh = match api.get(&name).await {
                    Ok(obj) => obj,
                    Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
                    Err(e) => return Err(AppError::Kubernetes(e)),
                };
                fresh.status = Some(status);
                let data = serde_json::to_vec(&fresh)?;
                api.replace_status(&name, &PostParams::default(), data)
                    .await
                    .map_err(AppError::Kubernetes)?;
                Ok(())
            }
        }),
    )
    .await?;

    if triggered {
        let patch = serde_json::json!({
            "metadata": { "annotations": { (ANNOTATION_TRIGGER_DISCOVERY): null } }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(AppError::Kubernetes)?;
    }

    ctx.backoff.reset(&format!("{namespace}/{name}"));
    metrics::get().observe_reconcile(
        "DiscoveryConfig",
        "ok",
        start.elapsed().as_secs_f64(),
    );

    Ok(Action::requeue(ctx.settings.discovery_tick_interval))
}

fn error_policy(
    dc: Arc<DiscoveryConfig>,
    error: &AppError,
    ctx: Arc<DiscoveryContext>,
) -> Action {
    let key = format!("{}/{}", dc.namespace().unwrap_or_default(), dc.name_any());
    let category = error.category();
    log::warn!(
        "DiscoveryConfig {} reconcile failed ({}): {}",
        key,
        category.as_str(),
        error
    );
    metrics::get().observe_reconcile("DiscoveryConfig", category.as_str(), 0.0);

    match category {
        ErrorCategory::Conflict => Action::requeue(Duration::ZERO),
        _ => Action::requeue(ctx.backoff.next_delay(&key)),
    }
}

/// Runs the discovery controller until shutdown
pub async fn run_discovery_controller(ctx: Arc<DiscoveryContext>) {
    let api: Api<DiscoveryConfig> = Api::all(ctx.client.clone());

    log::info!("Starting DiscoveryConfig controller");

    Controller::new(api, watcher::Config::default())
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
