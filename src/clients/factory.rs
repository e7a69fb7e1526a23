use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::client::Client;
use tokio::sync::{Mutex, RwLock};

use crate::clients::credentials::{
    client_from_kubeconfig_secret, client_from_workload_identity, ClusterToken, CredentialStrategy,
};
use crate::config::Settings;
use crate::crd::EnvironmentSpec;
use crate::error::{AppError, AppResult};
use crate::kubernetes::api::{with_timeout, REMOTE_CALL_TIMEOUT};

/// An authenticated client for one environment
#[derive(Clone)]
pub struct ClientHandle {
    pub environment: String,
    pub client: Client,
}

impl ClientHandle {
    /// Liveness probe: a version call against the apiserver under the
    /// remote-call deadline.
    pub async fn probe(&self) -> AppResult<()> {
        log::debug!("Probing environment {}", self.environment);
        with_timeout(REMOTE_CALL_TIMEOUT, "liveness probe", async {
            self.client
                .apiserver_version()
                .await
                .map_err(AppError::Kubernetes)?;
            Ok(())
        })
        .await
    }
}

struct CacheEntry {
    client: Client,
    /// Serialized cluster spec the entry was built from; a mismatch means
    /// the environment config changed and the entry is stale
    spec_fingerprint: String,
    token: Option<ClusterToken>,
    probe_failures: u32,
}

/// Produces and caches authenticated clients per environment. Entries are
/// invalidated on config change, Unauthorized responses, or too many
/// consecutive liveness failures; reconstruction is serialized per
/// environment so credential exchanges do not stampede.
pub struct ClientFactory {
    local: Client,
    settings: Arc<Settings>,
    http: reqwest::Client,
    cache: RwLock<HashMap<String, CacheEntry>>,
    rebuild_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn fingerprint(env: &EnvironmentSpec) -> String {
    serde_json::to_string(&env.cluster).unwrap_or_default()
}

impl ClientFactory {
    pub fn new(local: Client, settings: Arc<Settings>) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(ClientFactory {
            local,
            settings,
            http,
            cache: RwLock::new(HashMap::new()),
            rebuild_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Authenticated client for `env`, cached until invalidated. Expired
    /// workload-identity tokens are refreshed here, lazily.
    pub async fn client_for(&self, env: &EnvironmentSpec) -> AppResult<ClientHandle> {
        let wanted = fingerprint(env);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&env.name) {
                let token_fresh = entry
                    .token
                    .as_ref()
                    .map(|t| !t.is_expired(Utc::now()))
                    .unwrap_or(true);
                if entry.spec_fingerprint == wanted && token_fresh {
                    return Ok(ClientHandle {
                        environment: env.name.clone(),
                        client: entry.client.clone(),
                    });
                }
            }
        }

        // serialize reconstruction per environment
        let rebuild_lock = {
            let mut locks = self.rebuild_locks.lock().await;
            locks
                .entry(env.name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = rebuild_lock.lock().await;

        // another task may have rebuilt while we waited
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&env.name) {
                let token_fresh = entry
                    .token
                    .as_ref()
                    .map(|t| !t.is_expired(Utc::now()))
                    .unwrap_or(true);
                if entry.spec_fingerprint == wanted && token_fresh {
                    return Ok(ClientHandle {
                        environment: env.name.clone(),
                        client: entry.client.clone(),
                    });
                }
            }
        }

        log::info!("Building cluster client for environment {}", env.name);
        let (client, token) = self.build(env).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            env.name.clone(),
            CacheEntry {
                client: client.clone(),
                spec_fingerprint: wanted,
                token,
                probe_failures: 0,
            },
        );

        Ok(ClientHandle {
            environment: env.name.clone(),
            client,
        })
    }

    async fn build(&self, env: &EnvironmentSpec) -> AppResult<(Client, Option<ClusterToken>)> {
        match CredentialStrategy::for_environment(env) {
            CredentialStrategy::InCluster => Ok((self.local.clone(), None)),
            CredentialStrategy::KubeconfigSecret(kc) => {
                let client = client_from_kubeconfig_secret(
                    &self.local,
                    &self.settings.pod_namespace,
                    &kc,
                )
                .await?;
                Ok((client, None))
            }
            CredentialStrategy::WorkloadIdentity(wi) => {
                let (client, token) =
                    client_from_workload_identity(&self.http, &wi, &env.cluster).await?;
                Ok((client, Some(token)))
            }
        }
    }

    /// Throw away the cached client for an environment, e.g. after an
    /// Unauthorized response.
    pub async fn invalidate(&self, env_name: &str) {
        let mut cache = self.cache.write().await;
        if cache.remove(env_name).is_some() {
            log::info!("Invalidated cached client for environment {}", env_name);
        }
    }

    /// Record a liveness-probe failure; at the configured threshold the
    /// entry is dropped so the next call rebuilds it.
    pub async fn record_probe_failure(&self, env_name: &str) {
        let threshold = self.settings.client_cache_liveness_threshold;
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get_mut(env_name) {
            entry.probe_failures = entry.probe_failures.saturating_add(1);
            if entry.probe_failures >= threshold {
                cache.remove(env_name);
                log::warn!(
                    "Environment {} failed {} consecutive liveness probes, dropping cached client",
                    env_name,
                    threshold
                );
            }
        }
    }

    /// Clear the failure streak after a successful probe
    pub async fn record_probe_success(&self, env_name: &str) {
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get_mut(env_name) {
            entry.probe_failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterRef;

    #[test]
    fn fingerprint_tracks_cluster_config_only() {
        let mut env = EnvironmentSpec {
            name: "prod".to_string(),
            cluster: ClusterRef {
                name: "c1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let before = fingerprint(&env);

        // non-cluster changes keep the client cacheable
        env.namespaces = vec!["extra".to_string()];
        assert_eq!(fingerprint(&env), before);

        env.cluster.name = "c2".to_string();
        assert_ne!(fingerprint(&env), before);
    }
}
