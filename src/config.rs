use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Process-wide settings, read from the environment once at startup and
/// shared behind an `Arc`. Reconcile paths never touch the environment.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Namespace agent-registry resources live in when none is given
    pub pod_namespace: String,
    /// Authentication toggle for the collaborating HTTP surface. The core
    /// accepts writes unconditionally; this is surfaced so collaborators can
    /// read one source of truth.
    pub disable_auth: bool,
    /// Interval between discovery syncs per environment
    pub discovery_tick_interval: Duration,
    /// Upper bound for a single deployment reconcile iteration
    pub deployment_reconcile_timeout: Duration,
    /// Consecutive liveness-probe failures before a cached cluster client
    /// is thrown away
    pub client_cache_liveness_threshold: u32,
}

impl Settings {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let pod_namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| "agent-registry".to_string());

        let disable_auth = lookup("AGENTREGISTRY_DISABLE_AUTH")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        let discovery_tick_interval =
            parse_seconds(&lookup, "DISCOVERY_TICK_INTERVAL", 60)?;
        let deployment_reconcile_timeout =
            parse_seconds(&lookup, "DEPLOYMENT_RECONCILE_TIMEOUT", 30)?;

        let client_cache_liveness_threshold = match lookup("CLIENT_CACHE_LIVENESS_THRESHOLD") {
            None => 3,
            Some(raw) => raw.parse::<u32>().map_err(|_| {
                AppError::Config(format!(
                    "CLIENT_CACHE_LIVENESS_THRESHOLD must be an integer, got {:?}",
                    raw
                ))
            })?,
        };

        Ok(Settings {
            pod_namespace,
            disable_auth,
            discovery_tick_interval,
            deployment_reconcile_timeout,
            client_cache_liveness_threshold,
        })
    }
}

fn parse_seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default_secs: u64,
) -> AppResult<Duration> {
    match lookup(key) {
        None => Ok(Duration::from_secs(default_secs)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| AppError::Config(format!("{} must be whole seconds, got {:?}", key, raw))),
    }
}
