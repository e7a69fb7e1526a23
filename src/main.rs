mod catalog;
mod clients;
mod config;
mod crd;
mod deployment;
mod discovery;
mod error;
mod index;
mod kubernetes;
mod metrics;

use std::fmt::Debug;
use std::sync::Arc;

use actix_web::{get, web::get as web_get, App, HttpResponse, HttpServer, Responder};
use actix_web_opentelemetry::{PrometheusMetricsHandler, RequestMetrics};
use futures_util::StreamExt;
use kube::runtime::reflector::{reflector, store, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{api::Api, client::Client, Resource};
use opentelemetry::global;
use opentelemetry_sdk::metrics::MeterProvider;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::catalog::{run_catalog_controller, CatalogContext};
use crate::clients::ClientFactory;
use crate::config::Settings;
use crate::crd::{
    AgentCatalog, MCPServerCatalog, ModelCatalog, RegistryDeployment, SkillCatalog,
};
use crate::deployment::{run_deployment_controller, DeploymentContext};
use crate::discovery::{run_discovery_controller, DiscoveryContext};
use crate::error::{format_anyhow_chain, format_error_chain};
use crate::index::{catalog_index, deployment_index};
use crate::kubernetes::BackoffTracker;

#[get("/healthz")]
async fn healthz() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

async fn start_http(registry: prometheus::Registry) -> Result<(), std::io::Error> {
    log::info!("Serving /metrics and /healthz at http://0.0.0.0:8080");

    HttpServer::new(move || {
        App::new()
            .wrap(RequestMetrics::default())
            .route(
                "/metrics",
                web_get().to(PrometheusMetricsHandler::new(registry.clone())),
            )
            .service(healthz)
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}

/// Feed one kind's informer cache from a watch. The returned store backs
/// the registered field indexes; reconciliation waits for it to warm up.
fn spawn_reflector<K>(client: &Client, kind: &'static str) -> Store<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    let (reader, writer) = store::<K>();
    let stream = reflector(
        writer,
        watcher(Api::<K>::all(client.clone()), watcher::Config::default()),
    );
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream.applied_objects());
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                log::warn!("{} cache stream error: {}", kind, e);
            }
        }
    });
    reader
}

#[actix_web::main]
#[allow(clippy::expect_used)]
async fn main() -> std::io::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .filter_module("kube_runtime::controller", log::LevelFilter::Warn)
        .filter_module("actix_web::middleware::logger", log::LevelFilter::Warn)
        .filter_module("agent_registry", log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let settings =
        Arc::new(Settings::from_env().expect("Failed to read configuration from environment"));
    log::info!(
        "agent-registry starting for {}/{} in namespace {} (auth disabled: {})",
        crd::API_GROUP,
        crd::API_VERSION,
        settings.pod_namespace,
        settings.disable_auth
    );

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .expect("Failed to build OpenTelemetry Prometheus exporter");
    let provider = MeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);
    if let Err(e) = metrics::init(&registry) {
        log::error!("Failed to register metrics: {}", format_anyhow_chain(&e));
        std::process::exit(1);
    }

    let client = Client::try_default()
        .await
        .expect("Failed to create Kubernetes client");

    // informer caches behind the registered secondary indexes
    let mcp_servers = Arc::new(catalog_index(spawn_reflector::<MCPServerCatalog>(
        &client,
        "MCPServerCatalog",
    )));
    let agents = Arc::new(catalog_index(spawn_reflector::<AgentCatalog>(
        &client,
        "AgentCatalog",
    )));
    let skills = Arc::new(catalog_index(spawn_reflector::<SkillCatalog>(
        &client,
        "SkillCatalog",
    )));
    let models = Arc::new(catalog_index(spawn_reflector::<ModelCatalog>(
        &client,
        "ModelCatalog",
    )));
    let deployments = Arc::new(deployment_index(spawn_reflector::<RegistryDeployment>(
        &client,
        "RegistryDeployment",
    )));

    // cache warm-up gates the control loops
    mcp_servers
        .wait_until_ready()
        .await
        .expect("MCPServerCatalog cache failed to warm up");
    agents
        .wait_until_ready()
        .await
        .expect("AgentCatalog cache failed to warm up");
    skills
        .wait_until_ready()
        .await
        .expect("SkillCatalog cache failed to warm up");
    models
        .wait_until_ready()
        .await
        .expect("ModelCatalog cache failed to warm up");
    deployments
        .wait_until_ready()
        .await
        .expect("RegistryDeployment cache failed to warm up");
    log::info!("Informer caches warmed up");

    let factory = Arc::new(
        ClientFactory::new(client.clone(), settings.clone())
            .expect("Failed to construct cluster client factory"),
    );

    let mcp_ctx = Arc::new(CatalogContext {
        client: client.clone(),
        index: mcp_servers.clone(),
        agents: agents.clone(),
        backoff: BackoffTracker::new(),
    });
    let agent_ctx = Arc::new(CatalogContext {
        client: client.clone(),
        index: agents.clone(),
        agents: agents.clone(),
        backoff: BackoffTracker::new(),
    });
    let skill_ctx = Arc::new(CatalogContext {
        client: client.clone(),
        index: skills.clone(),
        agents: agents.clone(),
        backoff: BackoffTracker::new(),
    });
    let model_ctx = Arc::new(CatalogContext {
        client: client.clone(),
        index: models.clone(),
        agents: agents.clone(),
        backoff: BackoffTracker::new(),
    });
    let discovery_ctx = Arc::new(DiscoveryContext::new(
        client.clone(),
        factory.clone(),
        settings.clone(),
    ));
    let deployment_ctx = Arc::new(DeploymentContext {
        client: client.clone(),
        factory,
        settings,
        mcp_servers,
        agents,
        deployments,
        backoff: BackoffTracker::new(),
    });

    let controllers = async {
        tokio::join!(
            run_catalog_controller::<MCPServerCatalog>(mcp_ctx),
            run_catalog_controller::<AgentCatalog>(agent_ctx),
            run_catalog_controller::<SkillCatalog>(skill_ctx),
            run_catalog_controller::<ModelCatalog>(model_ctx),
            run_discovery_controller(discovery_ctx),
            run_deployment_controller(deployment_ctx),
        );
    };

    tokio::select! {
        result = Box::pin(start_http(registry)) => {
            if let Err(e) = result {
                log::error!("HTTP server exited: {}", format_error_chain(&e));
            }
        },
        _ = Box::pin(controllers) => {
            log::info!("Controllers exited");
        },
    };

    Ok(())
}
