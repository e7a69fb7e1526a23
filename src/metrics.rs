use std::sync::OnceLock;

use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use prometheus::{IntGaugeVec, Opts};

pub struct Metrics {
    pub reconciles: Counter<u64>,
    pub reconcile_duration_seconds: Histogram<f64>,
    pub discovery_syncs: Counter<u64>,
    pub deploy_operations: Counter<u64>,
    pub discovered_resources: IntGaugeVec,
    pub environment_connected: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub fn init(registry: &prometheus::Registry) -> Result<(), anyhow::Error> {
    let meter = global::meter("agentregistry");

    let discovered_resources = IntGaugeVec::new(
        Opts::new(
            "agentregistry_discovered_resources",
            "Catalog records discovered per environment and kind",
        ),
        &["environment", "kind"],
    )?;
    registry.register(Box::new(discovered_resources.clone()))?;

    let environment_connected = IntGaugeVec::new(
        Opts::new(
            "agentregistry_environment_connected",
            "Whether a discovery environment is currently connected (1) or not (0)",
        ),
        &["environment"],
    )?;
    registry.register(Box::new(environment_connected.clone()))?;

    let metrics = Metrics {
        reconciles: meter.u64_counter("agentregistry_reconciles_total").init(),
        reconcile_duration_seconds: meter
            .f64_histogram("agentregistry_reconcile_duration_seconds")
            .init(),
        discovery_syncs: meter
            .u64_counter("agentregistry_discovery_syncs_total")
            .init(),
        deploy_operations: meter
            .u64_counter("agentregistry_deploy_operations_total")
            .init(),
        discovered_resources,
        environment_connected,
    };

    METRICS
        .set(metrics)
        .map_err(|_| anyhow::anyhow!("Metrics already initialized"))?;

    Ok(())
}

#[allow(clippy::expect_used)]
pub fn get() -> &'static Metrics {
    METRICS
        .get()
        .expect("Metrics not initialized - call metrics::init() first")
}

impl Metrics {
    /// Count one reconcile outcome for a kind, labeled by error category
    /// ("ok" for success).
    pub fn observe_reconcile(&self, kind: &'static str, outcome: &'static str, seconds: f64) {
        let attrs = [
            KeyValue::new("kind", kind),
            KeyValue::new("outcome", outcome),
        ];
        self.reconciles.add(1, &attrs);
        self.reconcile_duration_seconds.record(seconds, &attrs);
    }
}
